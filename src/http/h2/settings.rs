//! SETTINGS parameters (RFC 7540 Section 6.5)
//!
//! Each endpoint announces its own [`Settings`] and may change them
//! mid-connection. A field left at `None` was never sent and reads as the
//! protocol default.

use super::error::{Error, ErrorCode, Result};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use std::fmt;

/// Upper bound for SETTINGS_MAX_FRAME_SIZE
pub const MAX_MAX_FRAME_SIZE: u32 = 0x00FF_FFFF;

/// 2^31 - 1
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

macro_rules! settings_parameters {
    ($($variant:ident = $id:literal, $name:literal;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u16)]
        pub enum SettingsParameter {
            $($variant = $id,)*
        }

        impl SettingsParameter {
            /// Receivers ignore identifiers they do not know
            pub fn from_u16(id: u16) -> Option<Self> {
                match id {
                    $($id => Some(SettingsParameter::$variant),)*
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(SettingsParameter::$variant => $name,)*
                }
            }
        }
    };
}

settings_parameters! {
    HeaderTableSize = 0x1, "HEADER_TABLE_SIZE";
    EnablePush = 0x2, "ENABLE_PUSH";
    MaxConcurrentStreams = 0x3, "MAX_CONCURRENT_STREAMS";
    InitialWindowSize = 0x4, "INITIAL_WINDOW_SIZE";
    MaxFrameSize = 0x5, "MAX_FRAME_SIZE";
    MaxHeaderListSize = 0x6, "MAX_HEADER_LIST_SIZE";
}

impl SettingsParameter {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Error code a peer earns for sending `value`, if it is out of range
    pub fn check_value(self, value: u32) -> std::result::Result<(), ErrorCode> {
        let ok = match self {
            SettingsParameter::EnablePush => value <= 1,
            SettingsParameter::InitialWindowSize => {
                return if value <= MAX_WINDOW_SIZE {
                    Ok(())
                } else {
                    Err(ErrorCode::FlowControlError)
                };
            }
            SettingsParameter::MaxFrameSize => {
                (DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value)
            }
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ErrorCode::ProtocolError)
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    pub fn header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    /// Push is on until the client says otherwise
    pub fn enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    /// `None` is unlimited
    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    /// The parameters that were set, in identifier order
    pub fn parameters(&self) -> Vec<(SettingsParameter, u32)> {
        use SettingsParameter::*;
        [
            (HeaderTableSize, self.header_table_size),
            (EnablePush, self.enable_push.map(u32::from)),
            (MaxConcurrentStreams, self.max_concurrent_streams),
            (InitialWindowSize, self.initial_window_size),
            (MaxFrameSize, self.max_frame_size),
            (MaxHeaderListSize, self.max_header_list_size),
        ]
        .into_iter()
        .filter_map(|(param, value)| value.map(|v| (param, v)))
        .collect()
    }

    /// Record one parameter; a repeated identifier overwrites the earlier value
    pub fn set(&mut self, param: SettingsParameter, value: u32) {
        let slot = match param {
            SettingsParameter::EnablePush => {
                self.enable_push = Some(value != 0);
                return;
            }
            SettingsParameter::HeaderTableSize => &mut self.header_table_size,
            SettingsParameter::MaxConcurrentStreams => &mut self.max_concurrent_streams,
            SettingsParameter::InitialWindowSize => &mut self.initial_window_size,
            SettingsParameter::MaxFrameSize => &mut self.max_frame_size,
            SettingsParameter::MaxHeaderListSize => &mut self.max_header_list_size,
        };
        *slot = Some(value);
    }

    pub fn validate(&self) -> Result<()> {
        match self
            .parameters()
            .into_iter()
            .find(|(param, value)| param.check_value(*value).is_err())
        {
            Some((param, value)) => Err(Error::InvalidSettings(format!(
                "{} out of range: {}",
                param, value
            ))),
            None => Ok(()),
        }
    }

    /// Overlay every parameter `other` carries
    pub fn merge(&mut self, other: &Settings) {
        for (param, value) in other.parameters() {
            self.set(param, value);
        }
    }
}

/// Validating builder for [`Settings`]
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        SettingsBuilder::default()
    }

    fn with(mut self, param: SettingsParameter, value: u32) -> Self {
        self.settings.set(param, value);
        self
    }

    pub fn header_table_size(self, size: u32) -> Self {
        self.with(SettingsParameter::HeaderTableSize, size)
    }

    pub fn enable_push(self, enable: bool) -> Self {
        self.with(SettingsParameter::EnablePush, enable as u32)
    }

    pub fn max_concurrent_streams(self, max: u32) -> Self {
        self.with(SettingsParameter::MaxConcurrentStreams, max)
    }

    pub fn initial_window_size(self, size: u32) -> Self {
        self.with(SettingsParameter::InitialWindowSize, size)
    }

    pub fn max_frame_size(self, size: u32) -> Self {
        self.with(SettingsParameter::MaxFrameSize, size)
    }

    pub fn max_header_list_size(self, size: u32) -> Self {
        self.with(SettingsParameter::MaxHeaderListSize, size)
    }

    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
