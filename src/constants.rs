// SPDX-License-Identifier: GPL-3.0-only

//! Library-wide constants

use crate::core::stream::Size;

/// Event loop and worker timing
pub mod timing {
    use std::time::Duration;

    /// Longest sleep of the event loop between source polls
    pub const LOOP_POLL_INTERVAL: Duration = Duration::from_millis(2);

    /// Default timeout for synchronous calls into the algorithm worker
    pub const IPA_CALL_TIMEOUT_MS: u64 = 1000;

    /// How long the CLI waits for one request to complete
    pub const CAPTURE_TIMEOUT_SECS: u64 = 5;
}

/// Virtual test pipeline limits
pub mod virtual_pipeline {
    use crate::core::stream::Size;

    /// Media driver name matched by the virtual pipeline
    pub const DRIVER: &str = "vimc";

    pub const MIN_SIZE: Size = Size::new(48, 48);
    pub const MAX_SIZE: Size = Size::new(4096, 2160);

    /// The scaler triples the sensor size, which is 2-pixel aligned
    pub const SIZE_ALIGN: u32 = 6;

    pub const DEFAULT_SIZE: Size = Size::new(1920, 1080);

    pub const BUFFER_COUNT: u32 = 4;

    /// Entities that must exist on the media graph
    pub const SENSOR: &str = "Sensor B";
    pub const DEBAYER: &str = "Debayer B";
    pub const SCALER: &str = "Scaler";
    pub const CAPTURE: &str = "RGB/YUV Capture";
    pub const RAW_CAPTURE: &str = "Raw Capture 1";
}

/// ISP pipeline limits and buffer layouts
pub mod isp {
    use crate::core::stream::Size;

    /// Media driver name matched by the ISP pipeline
    pub const DRIVER: &str = "rkisp1";

    /// The only hardware revision the algorithms support
    pub const HW_REVISION_V10: u32 = 10;

    pub const MIN_SIZE: Size = Size::new(32, 16);
    pub const MAX_SIZE: Size = Size::new(4416, 3312);
    pub const DEFAULT_SIZE: Size = Size::new(1920, 1080);

    pub const OUTPUT_BUFFER_COUNT: u32 = 4;
    pub const DEFAULT_PARAM_BUFFERS: u32 = 4;
    pub const DEFAULT_STAT_BUFFERS: u32 = 4;

    pub const ISP: &str = "rkisp1_isp";
    pub const MAINPATH: &str = "rkisp1_mainpath";
    pub const PARAMS: &str = "rkisp1_params";
    pub const STATS: &str = "rkisp1_stats";

    // ===== Parameter buffer =====

    /// `module_en_update` word offset
    pub const PARAM_EN_UPDATE_OFFSET: usize = 0;
    /// `module_ens` word offset
    pub const PARAM_ENS_OFFSET: usize = 4;
    pub const PARAM_BUFFER_SIZE: usize = 64;

    /// Auto exposure measurement block
    pub const MODULE_AEC: u32 = 1 << 14;

    // ===== Statistics buffer =====

    /// `meas_type` word offset
    pub const STAT_MEAS_TYPE_OFFSET: usize = 0;
    /// Auto exposure measurement present
    pub const STAT_AUTOEXP: u32 = 1 << 1;
    /// First exposure mean byte
    pub const STAT_AE_MEAN_OFFSET: usize = 4;
    /// Number of exposure mean zones
    pub const AE_MEAN_ZONES: usize = 25;
    pub const STAT_BUFFER_SIZE: usize = 64;
}

/// Auto exposure tuning
pub mod ae {
    /// Target mean luminance
    pub const TARGET: f64 = 60.0;

    /// Zones at or below this mean are ignored
    pub const MEAN_FLOOR: u8 = 15;

    /// Exposure is recomputed on every Nth frame
    pub const ADJUST_PERIOD: u32 = 3;

    /// Correction factors this close to 1.0 count as converged
    pub const LOCK_TOLERANCE: f64 = 0.05;
}

/// Short human label for a frame size
pub fn size_label(size: Size) -> Option<&'static str> {
    match size.width {
        w if w >= 3840 => Some("4K"),
        w if w >= 2560 => Some("2K"),
        w if w >= 1920 => Some("HD"),
        w if w >= 1280 => Some("720p"),
        w if w >= 640 => Some("SD"),
        _ => None,
    }
}

/// Library information
pub mod app_info {
    /// Version from build-time environment
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }
}
