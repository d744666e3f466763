/*
    QICTape

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------
*/

//! The `ftape_config` crate reads the `qictape.toml` configuration file and overlays
//! command line arguments on top of it. Command line arguments always take priority over
//! the file.
//!
//! The file has three tables, all optional:
//! - `[session]`: engine parameters, see [SessionConfig].
//! - `[sim]`: the simulated drive and cartridge, see [SimConfig].
//! - `[exercise]`: what the headless front end does with the session.
//!
//! Features:
//! - `use_bpaf`: Enable BPAF support for command line argument parsing.

#[cfg(feature = "use_bpaf")]
mod bpaf_config;

use std::path::{Path, PathBuf};

use ftape_core::{sim::SimConfig, SessionConfig};

#[cfg(feature = "use_bpaf")]
pub use bpaf_config::CmdLineArgs;
#[cfg(feature = "use_bpaf")]
use bpaf_config::cli_args;

use cfg_if::cfg_if;
use serde_derive::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "qictape.toml";

#[cfg(not(feature = "use_bpaf"))]
#[derive(Debug, Default)]
pub struct CmdLineArgs {
    pub config_file: Option<PathBuf>,
    pub start_segment: Option<u32>,
    pub segments: Option<u32>,
    pub file_marks: Option<u32>,
    pub crc_faults: Option<u32>,
    pub data_rate: Option<ftape_core::device_types::qic117::DataRate>,
    pub no_read_ahead: bool,
    pub wakeup: Option<ftape_core::devices::vendors::WakeupMethod>,
    pub seed: Option<u64>,
    pub skip_bias: Option<i32>,
    pub write_protect: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Exercise {
    /// First segment written. Clamped to the first data segment of the cartridge.
    pub start_segment: u32,
    /// Segments written and read back.
    pub segments: u32,
    /// File marks written after the data.
    pub file_marks: u32,
    /// Data CRC errors injected at random sectors of the written range before reading back.
    pub crc_faults: u32,
    /// Rewrite the header segments on close.
    pub close: bool,
}

impl Default for Exercise {
    fn default() -> Self {
        Exercise {
            start_segment: 10,
            segments: 8,
            file_marks: 1,
            crc_faults: 2,
            close: true,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFileParams {
    pub session: SessionConfig,
    pub sim: SimConfig,
    pub exercise: Exercise,
}

impl ConfigFileParams {
    pub fn overlay(&mut self, shell_args: CmdLineArgs) {
        if let Some(start_segment) = shell_args.start_segment {
            self.exercise.start_segment = start_segment;
        }
        if let Some(segments) = shell_args.segments {
            self.exercise.segments = segments;
        }
        if let Some(file_marks) = shell_args.file_marks {
            self.exercise.file_marks = file_marks;
        }
        if let Some(crc_faults) = shell_args.crc_faults {
            self.exercise.crc_faults = crc_faults;
        }

        if let Some(data_rate) = shell_args.data_rate {
            self.session.data_rate = Some(data_rate);
        }
        self.session.read_ahead &= !shell_args.no_read_ahead;

        if let Some(wakeup) = shell_args.wakeup {
            self.sim.wakeup = wakeup;
        }
        if let Some(seed) = shell_args.seed {
            self.sim.seed = seed;
        }
        if let Some(skip_bias) = shell_args.skip_bias {
            self.sim.skip_bias = skip_bias;
        }
        self.sim.write_protected |= shell_args.write_protect;
    }
}

pub fn read_config(toml_string: impl AsRef<str>, shell_args: CmdLineArgs) -> Result<ConfigFileParams, anyhow::Error> {
    let mut toml_args: ConfigFileParams = toml::from_str(toml_string.as_ref())?;

    // Command line arguments override config file arguments
    toml_args.overlay(shell_args);

    log::debug!("read_config(): {:?}", toml_args);
    Ok(toml_args)
}

fn shell_args() -> CmdLineArgs {
    cfg_if! {
        if #[cfg(feature = "use_bpaf")] {
            log::debug!("Reading command line arguments...");
            cli_args().run()
        } else {
            log::debug!("Argument reading disabled...");
            CmdLineArgs::default()
        }
    }
}

/// Read the TOML configuration from a file path, parse and overlay command line arguments.
/// A missing file at the default path leaves every setting at its default; a missing file
/// named on the command line is an error.
pub fn read_config_file<P>(default_path: P) -> Result<ConfigFileParams, anyhow::Error>
where
    P: AsRef<Path>,
{
    let shell_args = shell_args();

    // Allow configuration file path to be overridden by command line argument 'config_file'
    let toml_string = if let Some(configfile_path) = shell_args.config_file.as_ref() {
        std::fs::read_to_string(configfile_path)?
    }
    else {
        let default_path: PathBuf = default_path.as_ref().to_path_buf();
        match std::fs::read_to_string(&default_path) {
            Ok(toml_string) => toml_string,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("No configuration file at {}, using defaults", default_path.display());
                String::new()
            }
            Err(e) => return Err(e.into()),
        }
    };

    read_config(toml_string, shell_args)
}

/// Read the TOML configuration from a string, parse and overlay command line arguments.
pub fn read_config_string(toml_string: impl AsRef<str>) -> Result<ConfigFileParams, anyhow::Error> {
    read_config(toml_string, shell_args())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftape_core::{
        device_types::qic117::{DataRate, QicStandard},
        devices::vendors::WakeupMethod,
    };

    #[test]
    fn test_empty_file_is_all_defaults() {
        let params = read_config("", CmdLineArgs::default()).unwrap();
        assert_eq!(params.session.segment_retries, SessionConfig::default().segment_retries);
        assert_eq!(params.sim.standard, QicStandard::Qic80);
        assert_eq!(params.exercise.segments, 8);
    }

    #[test]
    fn test_tables_are_read() {
        let toml = r#"
            [session]
            data_rate = "500"
            soft_retries = 4

            [session.quirks]
            crc_error_already_past = false

            [sim]
            standard = "qic3020"
            wakeup = "mountain"
            rates = ["1000", "2000"]

            [exercise]
            segments = 3
        "#;
        let params = read_config(toml, CmdLineArgs::default()).unwrap();
        assert_eq!(params.session.data_rate, Some(DataRate::Rate500));
        assert_eq!(params.session.soft_retries, 4);
        assert!(!params.session.quirks.crc_error_already_past);
        assert_eq!(params.session.quirks.report_extra_ack_delay_ms, 8);
        assert_eq!(params.sim.standard, QicStandard::Qic3020);
        assert_eq!(params.sim.wakeup, WakeupMethod::Mountain);
        assert_eq!(params.sim.rates, vec![DataRate::Rate1000, DataRate::Rate2000]);
        assert_eq!(params.exercise.segments, 3);
        assert_eq!(params.exercise.file_marks, 1);
    }

    #[test]
    fn test_command_line_overrides_file() {
        let toml = r#"
            [sim]
            seed = 7
            [exercise]
            segments = 3
        "#;
        let args = CmdLineArgs {
            segments: Some(12),
            wakeup: Some(WakeupMethod::Insight),
            no_read_ahead: true,
            write_protect: true,
            ..Default::default()
        };
        let params = read_config(toml, args).unwrap();
        assert_eq!(params.exercise.segments, 12);
        assert_eq!(params.sim.seed, 7);
        assert_eq!(params.sim.wakeup, WakeupMethod::Insight);
        assert!(!params.session.read_ahead);
        assert!(params.sim.write_protected);
    }

    #[test]
    fn test_bad_value_is_an_error() {
        assert!(read_config("[sim]\nstandard = \"qic99\"\n", CmdLineArgs::default()).is_err());
    }
}
