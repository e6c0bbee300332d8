use std::path::Path;

use eyre::{bail, eyre, Result, WrapErr};
use owo_colors::OwoColorize;
use sigscope::{
    asm::disassemble_bytes, Bitness, CapstoneDecoder, Pattern, PeImage, Segment,
    SignatureGenerator,
};
use tracing::{debug, info, warn};

use crate::config::Config;

/// Open `file`, failing with a readable report
pub fn open_image(file: &Path) -> Result<PeImage> {
    let mut image = PeImage::new();
    image
        .load(file)
        .wrap_err_with(|| format!("failed to load {}", file.display()))?;

    Ok(image)
}

/// Bytes mapped at `rva`, to the end of their section
fn code_at(image: &PeImage, rva: u32) -> Result<&[u8]> {
    image
        .find_pointer_by_rva(rva)
        .ok_or_else(|| eyre!("rva {rva:#x} is not backed by section data"))
}

fn virtual_address(image: &PeImage, rva: u32) -> u64 {
    image.image_base().unwrap_or_default().wrapping_add(u64::from(rva))
}

/// An explicit choice wins, then the image header, then the config
fn pick_bitness(explicit: Option<Bitness>, image: &PeImage, config: &Config) -> Result<Bitness> {
    match explicit.or(image.bitness()) {
        Some(bitness) => Ok(bitness),
        None => config.scan.bitness(),
    }
}

pub fn info(file: &Path) -> Result<()> {
    let image = open_image(file)?;

    println!("{} {}", "file:".bold(), file.display());
    println!("{} {:#x}", "size:".bold(), image.size());
    println!(
        "{} {:#x}",
        "image base:".bold(),
        image.image_base().unwrap_or_default()
    );
    if let Some(bitness) = image.bitness() {
        println!("{} {bitness}-bit", "machine:".bold());
    }
    println!(
        "{} {}",
        "version:".bold(),
        image.version().unwrap_or("<none>")
    );

    println!();
    println!(
        "{:<8} {:>10} {:>10} {:>10}",
        "name".underline(),
        "rva".underline(),
        "raw size".underline(),
        "offset".underline()
    );
    for section in image.sections() {
        println!(
            "{:<8} {:>#10x} {:>#10x} {:>#10x}",
            section.name.cyan(),
            section.virtual_address,
            section.raw_size,
            section.file_offset
        );
    }

    Ok(())
}

pub fn find(file: &Path, pattern: &str, all: bool) -> Result<()> {
    let pattern = Pattern::new(pattern).wrap_err("invalid pattern")?;
    let image = open_image(file)?;
    let data = image.data().ok_or_else(|| eyre!("image is not loaded"))?;

    let offsets = if all {
        pattern.find_iter(data).collect::<Vec<_>>()
    } else {
        image.find_file_offset_by_pattern(&pattern).into_iter().collect()
    };

    if offsets.is_empty() {
        bail!("pattern `{pattern}` not found");
    }

    for offset in offsets {
        match image.find_rva_by_file_offset(offset) {
            Some(rva) => println!(
                "{} {offset:#x}  {} {rva:#x}  {} {:#x}",
                "offset".green(),
                "rva".green(),
                "va".green(),
                virtual_address(&image, rva)
            ),
            None => println!("{} {offset:#x}  (outside any section)", "offset".green()),
        }
    }

    Ok(())
}

pub fn lookup_rva(file: &Path, rva: u32, count: usize) -> Result<()> {
    let image = open_image(file)?;

    let offset = image
        .find_file_offset_by_rva(rva)
        .ok_or_else(|| eyre!("rva {rva:#x} is not backed by section data"))?;
    let bytes = code_at(&image, rva)?;
    let shown = &bytes[..count.min(bytes.len())];

    println!("{} {offset:#x}", "offset".green());
    println!("{} {}", "bytes".green(), hex(shown));

    Ok(())
}

pub fn lookup_offset(file: &Path, offset: usize) -> Result<()> {
    let image = open_image(file)?;

    let rva = image
        .find_rva_by_file_offset(offset)
        .ok_or_else(|| eyre!("offset {offset:#x} is not inside any section"))?;

    println!(
        "{} {rva:#x}  {} {:#x}",
        "rva".green(),
        "va".green(),
        virtual_address(&image, rva)
    );

    Ok(())
}

pub fn sig(
    file: &Path,
    rva: u32,
    len: Option<usize>,
    bitness: Option<Bitness>,
    config: &Config,
) -> Result<()> {
    let image = open_image(file)?;
    let bitness = pick_bitness(bitness, &image, config)?;

    let code = code_at(&image, rva)?;
    let code = &code[..len.unwrap_or(code.len()).min(code.len())];

    let decoder = CapstoneDecoder::new(bitness)?;
    let generator =
        SignatureGenerator::new(decoder).with_max_instructions(config.scan.max_instructions);

    debug!(rva, len = code.len(), %bitness, "generating signature");
    let text = generator.generate(code, virtual_address(&image, rva))?;

    if text.is_empty() {
        bail!("no decodable instructions at rva {rva:#x}");
    }

    println!("{text}");

    let pattern = match Pattern::new(&text) {
        Ok(pattern) => pattern,
        Err(err) => {
            warn!(%err, "signature cannot be verified");
            return Ok(());
        }
    };

    // a signature is only useful if it leads back to where it came from
    let data = image.data().ok_or_else(|| eyre!("image is not loaded"))?;
    let hits = pattern.find_iter(data).collect::<Vec<_>>();
    let expected = image.find_file_offset_by_rva(rva);

    match verify(&hits, expected) {
        Verdict::Unique => info!("signature is unique"),
        Verdict::Missing => warn!("signature does not match its own image"),
        Verdict::Elsewhere(offset) => warn!(
            offset,
            expected = ?expected,
            "signature matches once, but not at its own offset"
        ),
        Verdict::Ambiguous(matches) => warn!(
            matches,
            "signature is not unique, extend it or pick another rva"
        ),
    }

    let wildcards = pattern
        .segments()
        .iter()
        .filter(|&&s| s == Segment::Wildcard)
        .count();
    debug!(len = pattern.len(), wildcards, "generated pattern");

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    /// one hit, where the signature was taken from
    Unique,
    Missing,
    /// one hit, at another file offset
    Elsewhere(usize),
    Ambiguous(usize),
}

fn verify(hits: &[usize], expected: Option<usize>) -> Verdict {
    match hits {
        [only] if Some(*only) == expected => Verdict::Unique,
        [other] => Verdict::Elsewhere(*other),
        [] => Verdict::Missing,
        _ => Verdict::Ambiguous(hits.len()),
    }
}

pub fn disasm(
    file: &Path,
    rva: u32,
    count: usize,
    bitness: Option<Bitness>,
    config: &Config,
) -> Result<()> {
    let image = open_image(file)?;
    let bitness = pick_bitness(bitness, &image, config)?;
    let code = code_at(&image, rva)?;

    let insts = disassemble_bytes(code, virtual_address(&image, rva), count, bitness)?;

    for inst in insts {
        println!("{:<32} {}", hex(&inst.bytes).dimmed(), inst);
    }

    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Accepts `0x` prefixed hex or decimal
pub fn parse_number(s: &str) -> Result<u64> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };

    parsed.wrap_err_with(|| format!("`{s}` is not a number"))
}
