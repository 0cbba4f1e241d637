//! HTTP/2 SETTINGS parameters (RFC 7540 Section 6.5.1).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::H2Error;
use crate::flowcontrol::{DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};
use crate::frame::{DEFAULT_MAX_FRAME_SIZE, MAX_PAYLOAD_LEN};
use crate::hpack::DEFAULT_TABLE_SIZE;

/// Settings identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
enum SettingId {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

impl SettingId {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x1 => Self::HeaderTableSize,
            0x2 => Self::EnablePush,
            0x3 => Self::MaxConcurrentStreams,
            0x4 => Self::InitialWindowSize,
            0x5 => Self::MaxFrameSize,
            0x6 => Self::MaxHeaderListSize,
            _ => return None,
        })
    }
}

/// HTTP/2 SETTINGS parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1). Default 4096.
    pub header_table_size: u32,
    /// SETTINGS_ENABLE_PUSH (0x2). Default 1 (enabled).
    pub enable_push: bool,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3). Default unlimited.
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4). Default 65535.
    pub initial_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE (0x5). Default 16384.
    pub max_frame_size: u32,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6). Default unlimited.
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_TABLE_SIZE as u32,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_WINDOW_SIZE as u32,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Client defaults: push disabled (ENABLE_PUSH=0).
    pub fn client_default() -> Self {
        Self {
            enable_push: false,
            ..Default::default()
        }
    }

    /// Encode settings as a sequence of 6-byte (id: u16, value: u32) pairs.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut put = |id: SettingId, value: u32| {
            buf.put_u16(id as u16);
            buf.put_u32(value);
        };
        put(SettingId::HeaderTableSize, self.header_table_size);
        put(SettingId::EnablePush, u32::from(self.enable_push));
        if let Some(v) = self.max_concurrent_streams {
            put(SettingId::MaxConcurrentStreams, v);
        }
        put(SettingId::InitialWindowSize, self.initial_window_size);
        put(SettingId::MaxFrameSize, self.max_frame_size);
        if let Some(v) = self.max_header_list_size {
            put(SettingId::MaxHeaderListSize, v);
        }
    }

    /// Decode a SETTINGS payload, applying each entry over the defaults.
    pub fn decode(payload: &[u8]) -> Result<Self, H2Error> {
        Self::default().merge(payload)
    }

    /// Apply a SETTINGS payload on top of `self`. Entries the peer omits keep
    /// their current value (RFC 7540 Section 6.5.3).
    pub fn merge(mut self, mut payload: &[u8]) -> Result<Self, H2Error> {
        if payload.len() % 6 != 0 {
            return Err(H2Error::FrameSizeError);
        }
        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            // Unknown settings MUST be ignored (RFC 7540 Section 6.5.2).
            let Some(id) = SettingId::from_u16(id) else {
                continue;
            };
            match id {
                SettingId::HeaderTableSize => self.header_table_size = value,
                SettingId::EnablePush => {
                    if value > 1 {
                        return Err(H2Error::ProtocolError("ENABLE_PUSH must be 0 or 1".into()));
                    }
                    self.enable_push = value == 1;
                }
                SettingId::MaxConcurrentStreams => self.max_concurrent_streams = Some(value),
                SettingId::InitialWindowSize => {
                    if i64::from(value) > MAX_WINDOW_SIZE {
                        return Err(H2Error::FlowControlError);
                    }
                    self.initial_window_size = value;
                }
                SettingId::MaxFrameSize => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_PAYLOAD_LEN as u32).contains(&value) {
                        return Err(H2Error::ProtocolError("MAX_FRAME_SIZE out of range".into()));
                    }
                    self.max_frame_size = value;
                }
                SettingId::MaxHeaderListSize => self.max_header_list_size = Some(value),
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u16, value: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(id);
        buf.put_u32(value);
        buf.to_vec()
    }

    #[test]
    fn client_settings_round_trip() {
        let mut buf = BytesMut::new();
        Settings::client_default().encode(&mut buf);
        let decoded = Settings::decode(&buf).unwrap();
        assert!(!decoded.enable_push);
        assert_eq!(decoded.header_table_size, 4096);
        assert_eq!(decoded.initial_window_size, 65535);
    }

    #[test]
    fn custom_settings_round_trip() {
        let settings = Settings {
            header_table_size: 8192,
            enable_push: false,
            max_concurrent_streams: Some(100),
            initial_window_size: 1_048_576,
            max_frame_size: 32768,
            max_header_list_size: Some(65536),
        };
        let mut buf = BytesMut::new();
        settings.encode(&mut buf);
        assert_eq!(Settings::decode(&buf).unwrap(), settings);
    }

    #[test]
    fn merge_keeps_omitted_values() {
        let current = Settings {
            initial_window_size: 1000,
            ..Settings::default()
        };
        let merged = current.merge(&entry(0x5, 20_000)).unwrap();
        assert_eq!(merged.initial_window_size, 1000);
        assert_eq!(merged.max_frame_size, 20_000);
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(Settings::decode(&entry(0x2, 2)).is_err());
        assert_eq!(
            Settings::decode(&entry(0x4, 0x8000_0000)).unwrap_err(),
            H2Error::FlowControlError
        );
        assert!(Settings::decode(&entry(0x5, 100)).is_err());
        assert_eq!(
            Settings::decode(&[0, 1, 0]).unwrap_err(),
            H2Error::FrameSizeError
        );
    }

    #[test]
    fn unknown_setting_ignored() {
        let decoded = Settings::decode(&entry(0xff, 42)).unwrap();
        assert_eq!(decoded, Settings::default());
    }
}
