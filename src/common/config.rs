//! configuration read from settings.json
//!
//! Lets a deployment override the UDP port, jitter depth, FEC cadence
//! and room password without rebuilding.  Missing keys fall back to
//! defaults and a missing file is created on first save.
use json::JsonValue;
use simple_error::bail;
use std::{
    fs::File,
    io::{ErrorKind, Write},
};

use crate::common::box_error::BoxError;
use crate::common::frame::SEQ_MAX;

pub const DEFAULT_PORT: u32 = 22124;
pub const DEFAULT_JITTER_MS: u32 = 8;
pub const DEFAULT_FEC_DISTANCE: u32 = 2;

pub struct Config {
    filename: String,
    settings: JsonValue,
}

impl Config {
    pub fn build() -> Config {
        Config {
            filename: String::from("settings.json"),
            settings: json::object! {},
        }
    }
    pub fn get_filename(&self) -> &str {
        &self.filename
    }
    pub fn load_from_file(&mut self) -> Result<bool, BoxError> {
        match std::fs::read_to_string(&self.filename) {
            Ok(raw_data) => {
                let parsed = json::parse(&raw_data)?;
                self.settings.clone_from(&parsed);
                Ok(true)
            }
            Err(_) => {
                // no file yet, write one with whatever we have
                self.save_settings()
            }
        }
    }

    pub fn get_value<'a>(&'a self, key: &str, def_value: &'a str) -> &str {
        match self.settings[key].as_str() {
            None => def_value,
            Some(v) => v,
        }
    }

    pub fn get_u32_value(&self, key: &str, def_value: u32) -> u32 {
        match self.settings[key].as_u32() {
            None => def_value,
            Some(v) => v,
        }
    }

    pub fn set_value(&mut self, key: &str, val: &str) -> () {
        self.settings[key] = val.into();
    }

    pub fn get_port(&self) -> u32 {
        self.get_u32_value("port", DEFAULT_PORT)
    }

    pub fn get_jitter_ms(&self) -> u16 {
        self.get_u32_value("jitter_buffer_ms", DEFAULT_JITTER_MS) as u16
    }

    /// the shared secret participants must echo in their ping
    pub fn get_password(&self) -> u64 {
        match self.get_value("password", "0").parse::<u64>() {
            Ok(v) => v,
            Err(_) => 0,
        }
    }

    /// payload frames between XOR masks
    ///
    /// Must evenly divide the sequence window or the receive side could
    /// never line its groups up.
    pub fn get_fec_distance(&self) -> Result<u8, BoxError> {
        let distance = self.get_u32_value("fec_distance", DEFAULT_FEC_DISTANCE);
        if distance < 1 || distance > SEQ_MAX as u32 || (SEQ_MAX as u32 % distance) != 0 {
            bail!("fec_distance {} must divide {}", distance, SEQ_MAX);
        }
        Ok(distance as u8)
    }

    pub fn save_settings(&self) -> Result<bool, BoxError> {
        let file_open_result = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.filename.as_str());
        match file_open_result {
            Ok(mut f) => self.flush_to_file(&mut f),
            Err(error) => match error.kind() {
                ErrorKind::NotFound => {
                    let mut f = std::fs::File::create(self.filename.as_str())?;
                    self.flush_to_file(&mut f)
                }
                other_error => {
                    bail!("cannot create settings file: {}", other_error);
                }
            },
        }
    }
    fn flush_to_file(&self, f: &mut File) -> Result<bool, BoxError> {
        f.write_all(self.settings.pretty(2).as_bytes())?;
        f.sync_all()?;
        Ok(true)
    }
}
