//! Command-line surface (§6): flags, defaults and verbosity mapping.

use std::path::PathBuf;

use clap::Parser;

use crate::profile::Profile;

/// Host-side firmware downloader for legacy GSM handset bootloaders.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Serial device the phone is attached to.
    #[arg(short = 'p', long = "port", default_value = "/dev/ttyUSB1")]
    pub device: PathBuf,

    /// Unix socket path exposing the layer2 (DLCI 0x05) tool server.
    #[arg(short = 's', long = "layer2-socket", default_value = "/tmp/osmocom_l2")]
    pub layer2_socket: PathBuf,

    /// Unix socket path exposing the loader (DLCI 0x09) tool server.
    #[arg(short = 'l', long = "loader-socket", default_value = "/tmp/osmocom_loader")]
    pub loader_socket: PathBuf,

    /// Target bootloader profile.
    #[arg(short = 'm', long = "mode", default_value = "c123")]
    pub profile: Profile,

    /// Increase logging verbosity; repeatable (info, debug, trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Firmware image to download.
    pub file: PathBuf,
}

impl Cli {
    /// Maps `-v` repeats onto a `log`/`env_logger` filter string, absent
    /// `-v` defaulting to `warn` (§10 supplemented features).
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

impl clap::ValueEnum for Profile {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Profile::C123,
            Profile::C123xor,
            Profile::C140,
            Profile::C140xor,
            Profile::C155,
            Profile::Romload,
        ]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        let name = match self {
            Profile::C123 => "c123",
            Profile::C123xor => "c123xor",
            Profile::C140 => "c140",
            Profile::C140xor => "c140xor",
            Profile::C155 => "c155",
            Profile::Romload => "romload",
        };
        Some(clap::builder::PossibleValue::new(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cli = Cli::parse_from(["osmoload", "firmware.bin"]);
        assert_eq!(cli.device, PathBuf::from("/dev/ttyUSB1"));
        assert_eq!(cli.layer2_socket, PathBuf::from("/tmp/osmocom_l2"));
        assert_eq!(cli.loader_socket, PathBuf::from("/tmp/osmocom_loader"));
        assert_eq!(cli.profile, Profile::C123);
        assert_eq!(cli.log_filter(), "warn");
    }

    #[test]
    fn verbose_flags_stack_into_log_levels() {
        let cli = Cli::parse_from(["osmoload", "-vv", "firmware.bin"]);
        assert_eq!(cli.log_filter(), "debug");
    }

    #[test]
    fn mode_flag_selects_profile() {
        let cli = Cli::parse_from(["osmoload", "-m", "romload", "firmware.bin"]);
        assert_eq!(cli.profile, Profile::Romload);
    }
}
