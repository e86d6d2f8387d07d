//! Screen projection records used to redirect touchscreen input.
//!
//! A source device projects one of its windows onto a sink screen. Touches
//! that land inside the projected rectangle on the sink are mapped back into
//! the source window's physical coordinate space.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key under which a sink screen record is stored.
pub fn screen_info_key(dev_id: &str, source_win_id: u64) -> String {
    format!("{dev_id}###{source_win_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScreenError {
    #[error("sink screen show size is zero")]
    ZeroShowSize,

    #[error("sink screen physical size is zero")]
    ZeroPhysicalSize,

    #[error("projection size is zero")]
    ZeroProjectionSize,
}

/// The projected window as described by the source device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SrcScreenInfo {
    /// Network id of the source device.
    pub dev_id: String,
    pub session_id: String,
    pub source_win_id: u64,
    pub source_win_width: u32,
    pub source_win_height: u32,
    /// Descriptor stamped on touch events that land in this projection.
    pub source_phy_id: String,
    pub source_phy_width: u32,
    pub source_phy_height: u32,
}

/// Precomputed mapping from sink physical coordinates into the source window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct TransformInfo {
    pub sink_win_phy_x: u32,
    pub sink_win_phy_y: u32,
    pub sink_proj_phy_width: u32,
    pub sink_proj_phy_height: u32,
    pub coeff_width: f64,
    pub coeff_height: f64,
}

impl TransformInfo {
    /// Whether a sink physical point lies inside the projection rectangle.
    ///
    /// Both bounds are inclusive.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        let (x, y) = (i64::from(x), i64::from(y));
        let left = i64::from(self.sink_win_phy_x);
        let top = i64::from(self.sink_win_phy_y);
        x >= left
            && x <= left + i64::from(self.sink_proj_phy_width)
            && y >= top
            && y <= top + i64::from(self.sink_proj_phy_height)
    }

    /// Map a sink physical point into source window coordinates.
    pub fn map_point(&self, x: i32, y: i32) -> (i32, i32) {
        (self.map_x(x), self.map_y(y))
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn map_x(&self, x: i32) -> i32 {
        ((f64::from(x) - f64::from(self.sink_win_phy_x)) * self.coeff_width) as i32
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn map_y(&self, y: i32) -> i32 {
        ((f64::from(y) - f64::from(self.sink_win_phy_y)) * self.coeff_height) as i32
    }
}

/// A sink screen and the source window projected onto it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct SinkScreenInfo {
    pub screen_id: u64,
    pub sink_show_width: u32,
    pub sink_show_height: u32,
    pub sink_phy_width: u32,
    pub sink_phy_height: u32,
    pub sink_proj_show_width: u32,
    pub sink_proj_show_height: u32,
    pub sink_win_show_x: u32,
    pub sink_win_show_y: u32,
    pub src_screen_info: SrcScreenInfo,
    pub transform: TransformInfo,
}

impl SinkScreenInfo {
    /// Convert the show-space window geometry into physical coordinates.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn compute_transform(&self) -> Result<TransformInfo, ScreenError> {
        if self.sink_show_width == 0 || self.sink_show_height == 0 {
            return Err(ScreenError::ZeroShowSize);
        }
        if self.sink_phy_width == 0 || self.sink_phy_height == 0 {
            return Err(ScreenError::ZeroPhysicalSize);
        }

        let scale_x = f64::from(self.sink_phy_width) / f64::from(self.sink_show_width);
        let scale_y = f64::from(self.sink_phy_height) / f64::from(self.sink_show_height);

        let sink_proj_phy_width = (f64::from(self.sink_proj_show_width) * scale_x) as u32;
        let sink_proj_phy_height = (f64::from(self.sink_proj_show_height) * scale_y) as u32;
        if sink_proj_phy_width == 0 || sink_proj_phy_height == 0 {
            return Err(ScreenError::ZeroProjectionSize);
        }

        let src = &self.src_screen_info;
        Ok(TransformInfo {
            sink_win_phy_x: (f64::from(self.sink_win_show_x) * scale_x) as u32,
            sink_win_phy_y: (f64::from(self.sink_win_show_y) * scale_y) as u32,
            sink_proj_phy_width,
            sink_proj_phy_height,
            coeff_width: f64::from(src.source_phy_width) / f64::from(sink_proj_phy_width),
            coeff_height: f64::from(src.source_phy_height) / f64::from(sink_proj_phy_height),
        })
    }

    /// Recompute and store the transform.
    pub fn update_transform(&mut self) -> Result<(), ScreenError> {
        self.transform = self.compute_transform()?;
        Ok(())
    }
}
