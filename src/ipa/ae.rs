// SPDX-License-Identifier: GPL-3.0-only

//! Basic auto exposure for the ISP pipeline
//!
//! Reads the per-zone exposure means from each statistics buffer, derives a
//! correction factor towards a fixed target and, every third frame, splits
//! the corrected exposure between sensor exposure time and analogue gain.

use std::collections::BTreeMap;

use tracing::{debug, info, trace};

use super::{EntityControls, IpaAction, IpaBuffer, IpaEvent, IpaInterface, IpaSensorInfo};
use crate::constants::{ae, isp};
use crate::core::controls::{ControlList, ControlValue, ids};
use crate::errors::{HalError, HalResult};
use crate::v4l2::ioctl::{V4L2_CID_ANALOGUE_GAIN, V4L2_CID_EXPOSURE};

/// Auto exposure algorithm of the ISP pipeline
#[derive(Debug, Default)]
pub struct BasicAe {
    buffers: BTreeMap<u64, IpaBuffer>,
    auto_exposure: bool,
    exposure: u32,
    min_exposure: u32,
    max_exposure: u32,
    gain: u32,
    min_gain: u32,
    max_gain: u32,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    if let Some(slot) = bytes.get_mut(offset..offset + 4) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
}

/// Mean of the exposure zones above the noise floor
fn exposure_mean(stats: &[u8]) -> Option<f64> {
    let zones = stats.get(isp::STAT_AE_MEAN_OFFSET..isp::STAT_AE_MEAN_OFFSET + isp::AE_MEAN_ZONES)?;
    let (sum, count) = zones
        .iter()
        .filter(|&&mean| mean > ae::MEAN_FLOOR)
        .fold((0u32, 0u32), |(sum, count), &mean| (sum + u32::from(mean), count + 1));
    (count > 0).then(|| f64::from(sum) / f64::from(count))
}

fn range_i32(controls: &crate::core::controls::ControlInfoMap, id: u32, name: &str) -> HalResult<(u32, u32)> {
    let info = controls
        .get(id)
        .ok_or_else(|| HalError::Configuration(format!("sensor has no {} control", name)))?;
    let min = info.min.as_i64().unwrap_or(1).max(1);
    let max = info.max.as_i64().unwrap_or(min).max(min);
    Ok((
        u32::try_from(min).unwrap_or(u32::MAX),
        u32::try_from(max).unwrap_or(u32::MAX),
    ))
}

impl BasicAe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exposure(&self) -> u32 {
        self.exposure
    }

    pub fn gain(&self) -> u32 {
        self.gain
    }

    fn buffer(&self, id: u64) -> HalResult<&IpaBuffer> {
        self.buffers
            .get(&id)
            .ok_or_else(|| HalError::Protocol(format!("buffer {} is not mapped", id)))
    }

    fn sensor_controls(&self, frame: u32) -> IpaAction {
        let mut controls = ControlList::new();
        controls.set(V4L2_CID_EXPOSURE, ControlValue::Int32(self.exposure as i32));
        controls.set(V4L2_CID_ANALOGUE_GAIN, ControlValue::Int32(self.gain as i32));
        IpaAction::V4l2Set { frame, controls }
    }

    fn queue_request(&mut self, frame: u32, param_buffer: u64, controls: &ControlList) -> HalResult<IpaAction> {
        let enable = controls.get(ids::AE_ENABLE).and_then(ControlValue::as_bool);

        let buffer = self
            .buffers
            .get(&param_buffer)
            .ok_or_else(|| HalError::Protocol(format!("buffer {} is not mapped", param_buffer)))?;
        let plane = buffer
            .planes
            .first()
            .ok_or_else(|| HalError::Protocol(format!("buffer {} has no planes", param_buffer)))?;
        let mut params = plane
            .write()
            .map_err(|_| HalError::Protocol("parameter buffer lock poisoned".into()))?;
        params.fill(0);

        if let Some(enable) = enable {
            if enable {
                write_u32(&mut params, isp::PARAM_ENS_OFFSET, isp::MODULE_AEC);
            }
            write_u32(&mut params, isp::PARAM_EN_UPDATE_OFFSET, isp::MODULE_AEC);
        }
        drop(params);

        if let Some(enable) = enable {
            if enable != self.auto_exposure {
                debug!(frame, enable, "Auto exposure toggled");
            }
            self.auto_exposure = enable;
        }

        Ok(IpaAction::ParamFilled { frame })
    }

    fn update_statistics(&mut self, frame: u32, buffer_id: u64, actions: &mut Vec<IpaAction>) -> HalResult<()> {
        let buffer = self.buffer(buffer_id)?;
        let plane = buffer
            .planes
            .first()
            .ok_or_else(|| HalError::Protocol(format!("buffer {} has no planes", buffer_id)))?;
        let mean = {
            let stats = plane
                .read()
                .map_err(|_| HalError::Protocol("statistics buffer lock poisoned".into()))?;
            if read_u32(&stats, isp::STAT_MEAS_TYPE_OFFSET) & isp::STAT_AUTOEXP != 0 {
                exposure_mean(&stats)
            } else {
                None
            }
        };

        let mut metadata = ControlList::new();
        if let Some(mean) = mean {
            let factor = ae::TARGET / mean;

            if self.auto_exposure && frame % ae::ADJUST_PERIOD == 0 {
                let total = factor * f64::from(self.exposure) * f64::from(self.gain)
                    / f64::from(self.min_gain);
                self.exposure = (total as u64).clamp(
                    u64::from(self.min_exposure),
                    u64::from(self.max_exposure),
                ) as u32;

                let gain = total / f64::from(self.exposure) * f64::from(self.min_gain);
                self.gain =
                    (gain as u64).clamp(u64::from(self.min_gain), u64::from(self.max_gain)) as u32;

                trace!(frame, mean, factor, exposure = self.exposure, gain = self.gain, "AE update");
                actions.push(self.sensor_controls(frame + 1));
            }

            let locked = (factor - 1.0).abs() < ae::LOCK_TOLERANCE;
            metadata.set(ids::AE_LOCKED, locked);
        }

        actions.push(IpaAction::Metadata { frame, metadata });
        Ok(())
    }
}

impl IpaInterface for BasicAe {
    fn name(&self) -> &str {
        "basic-ae"
    }

    fn init(&mut self, hw_revision: u32) -> HalResult<()> {
        if hw_revision != isp::HW_REVISION_V10 {
            return Err(HalError::device(
                libc::ENODEV,
                format!("hardware revision {} is not supported", hw_revision),
            ));
        }
        debug!(hw_revision, "Hardware revision accepted");
        Ok(())
    }

    fn configure(&mut self, sensor: &IpaSensorInfo, entity_controls: &EntityControls) -> HalResult<()> {
        let controls = entity_controls
            .get(&0)
            .ok_or_else(|| HalError::Configuration("no sensor controls".into()))?;

        let (min_exposure, max_exposure) = range_i32(controls, V4L2_CID_EXPOSURE, "exposure")?;
        let (min_gain, max_gain) = range_i32(controls, V4L2_CID_ANALOGUE_GAIN, "gain")?;

        self.auto_exposure = true;
        self.min_exposure = min_exposure;
        self.max_exposure = max_exposure;
        self.exposure = min_exposure;
        self.min_gain = min_gain;
        self.max_gain = max_gain;
        self.gain = min_gain;

        info!(
            sensor = %sensor.model,
            exposure = %format!("{}-{}", min_exposure, max_exposure),
            gain = %format!("{}-{}", min_gain, max_gain),
            "AE configured"
        );
        Ok(())
    }

    fn start(&mut self, actions: &mut Vec<IpaAction>) -> HalResult<()> {
        actions.push(self.sensor_controls(0));
        Ok(())
    }

    fn stop(&mut self) {}

    fn map_buffers(&mut self, buffers: Vec<IpaBuffer>) {
        for buffer in buffers {
            self.buffers.insert(buffer.id, buffer);
        }
    }

    fn unmap_buffers(&mut self, ids: &[u64]) {
        for id in ids {
            self.buffers.remove(id);
        }
    }

    fn process_event(&mut self, event: IpaEvent, actions: &mut Vec<IpaAction>) -> HalResult<()> {
        match event {
            IpaEvent::QueueRequest {
                frame,
                param_buffer,
                controls,
            } => {
                let action = self.queue_request(frame, param_buffer, &controls)?;
                actions.push(action);
            }
            IpaEvent::SignalStatBuffer { frame, buffer_id } => {
                self.update_statistics(frame, buffer_id, actions)?;
            }
        }
        Ok(())
    }
}
