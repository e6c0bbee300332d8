mod commands;
mod config;
mod logging;
mod paths;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::Result;
use sigscope::Bitness;
use tracing::debug;

use config::Config;
use logging::setup_logging;
use paths::get_config_filepath;

#[derive(Parser)]
#[command(name = "sigscope", version)]
#[command(about = "Find, generate and verify byte signatures in PE images")]
struct Args {
    /// config file, defaults to sigscope.toml in the user config dir
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show headers, version and section table
    Info { file: PathBuf },

    /// Search the file for a pattern like `48 8B ?? ?? 89`
    Find {
        file: PathBuf,
        pattern: String,
        /// report every match instead of the first
        #[arg(short, long)]
        all: bool,
    },

    /// Translate an rva to a file offset
    Rva {
        file: PathBuf,
        #[arg(value_parser = parse_u32)]
        rva: u32,
        /// bytes to show from the rva
        #[arg(short, long, default_value_t = 16)]
        bytes: usize,
    },

    /// Translate a file offset to an rva
    Offset {
        file: PathBuf,
        #[arg(value_parser = parse_usize)]
        offset: usize,
    },

    /// Generate a signature for the code at an rva
    Sig {
        file: PathBuf,
        #[arg(long, value_parser = parse_u32)]
        rva: u32,
        /// limit the bytes handed to the decoder
        #[arg(long)]
        len: Option<usize>,
        /// 32 or 64, defaults to the image's machine
        #[arg(long)]
        bitness: Option<Bitness>,
    },

    /// Disassemble the code at an rva
    Disasm {
        file: PathBuf,
        #[arg(long, value_parser = parse_u32)]
        rva: u32,
        #[arg(short = 'n', long, default_value_t = 16)]
        count: usize,
        /// 32 or 64, defaults to the image's machine
        #[arg(long)]
        bitness: Option<Bitness>,
    },
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let value = commands::parse_number(s).map_err(|e| e.to_string())?;
    u32::try_from(value).map_err(|_| format!("{s} does not fit 32 bits"))
}

fn parse_usize(s: &str) -> Result<usize, String> {
    let value = commands::parse_number(s).map_err(|e| e.to_string())?;
    usize::try_from(value).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => get_config_filepath()?,
    };
    let config = Config::load(config_path)?;

    setup_logging(&config)?;
    debug!(path = %config.path().display(), "loaded config");

    match args.command {
        Command::Info { file } => commands::info(&file),
        Command::Find { file, pattern, all } => commands::find(&file, &pattern, all),
        Command::Rva { file, rva, bytes } => commands::lookup_rva(&file, rva, bytes),
        Command::Offset { file, offset } => commands::lookup_offset(&file, offset),
        Command::Sig {
            file,
            rva,
            len,
            bitness,
        } => commands::sig(&file, rva, len, bitness, &config),
        Command::Disasm {
            file,
            rva,
            count,
            bitness,
        } => commands::disasm(&file, rva, count, bitness, &config),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_sig_args() {
        let argv = ["sigscope", "sig", "game.exe", "--rva", "0x1500", "--bitness", "32"];
        let args = Args::try_parse_from(argv).unwrap();

        let Command::Sig { rva, bitness, len, .. } = args.command else {
            panic!("expected sig command");
        };
        assert_eq!(rva, 0x1500);
        assert_eq!(bitness, Some(Bitness::X86));
        assert_eq!(len, None);

        assert!(Args::try_parse_from(["sigscope", "rva", "game.exe", "0x100000000"]).is_err());
    }
}
