#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use igfs::{DecryptedPartition, Filesystem, IgfsError, decrypt_partition};
use std::path::{Path, PathBuf};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "igfs", about = "IGEL filesystem (IGFS) image toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the partition table and section statistics of an image.
    Info {
        /// Path to the IGFS image or block device.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Extract a partition payload or a single extent.
    Extract {
        /// Path to the IGFS image.
        image: PathBuf,
        /// Partition minor number.
        minor: u32,
        /// Output file.
        out: PathBuf,
        /// Extent to extract (by name or type, e.g. `kernel`); the whole
        /// extent-free payload is written when omitted.
        #[arg(long)]
        extent: Option<String>,
    },
    /// Verify CRCs, hash chains and signatures of an image.
    Verify {
        /// Path to the IGFS image.
        image: PathBuf,
        /// Re-hash every section against the signed digest table.
        #[arg(long)]
        deep: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Decrypt an encrypted partition via the key management layer.
    Decrypt {
        /// Path to the IGFS image.
        image: PathBuf,
        /// Partition minor number.
        minor: u32,
        /// Output file for the decrypted container.
        out: PathBuf,
        /// Boot identifier; defaults to the image's boot registry entry.
        #[arg(long)]
        boot_id: Option<String>,
        /// Key slot to unwrap the master key from.
        #[arg(long, default_value_t = 0)]
        slot: usize,
    },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        let code = error
            .downcast_ref::<IgfsError>()
            .map_or(1, IgfsError::exit_code);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Info { image, json } => info(&image, json),
        Command::Extract {
            image,
            minor,
            out,
            extent,
        } => extract(&image, minor, extent.as_deref(), &out),
        Command::Verify { image, deep, json } => verify(&image, deep, json),
        Command::Decrypt {
            image,
            minor,
            out,
            boot_id,
            slot,
        } => decrypt(&image, minor, boot_id.as_deref(), slot, &out),
    }
}

fn info(path: &Path, json: bool) -> Result<()> {
    let fs = Filesystem::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;
    let info = fs.info().context("failed to read image structure")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info).context("serialize output")?
        );
        return Ok(());
    }

    println!("sections: {}", info.sections);
    println!("section_size: {}", info.section_size);
    if let Some(boot_id) = &info.boot_id {
        println!("boot_id: {boot_id}");
    }
    for partition in &info.partitions {
        println!(
            "partition {}: first_section={} sections={} type={} name={} size={} hash={} crypt={}",
            partition.minor,
            partition.first_section,
            partition.sections,
            partition.partition_type.as_deref().unwrap_or("?"),
            partition.name.as_deref().unwrap_or("-"),
            partition.size_bytes,
            partition.has_hash_block,
            partition.encrypted,
        );
        for extent in &partition.extents {
            println!(
                "  extent {}: name={} offset={} length={}",
                extent.extent_type,
                if extent.name.is_empty() { "-" } else { &extent.name },
                extent.offset,
                extent.length,
            );
        }
    }
    Ok(())
}

fn extract(path: &Path, minor: u32, extent: Option<&str>, out: &Path) -> Result<()> {
    let fs = Filesystem::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;
    let partition = fs
        .partition(minor)
        .with_context(|| format!("failed to load partition {minor}"))?;

    let data = match extent {
        Some(wanted) => {
            let descriptor = partition
                .find_extent_by_name(wanted)
                .or_else(|| {
                    partition.extents().iter().find(|extent| {
                        extent.get_type().map(|t| t.to_string()).as_deref() == Some(wanted)
                    })
                })
                .copied()
                .ok_or_else(|| {
                    IgfsError::NotFound(format!("extent {wanted} in partition {minor}"))
                })?;
            partition.extent_data(&descriptor)?
        }
        None => partition.payload(),
    };

    std::fs::write(out, &data)
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!("wrote {} bytes to {}", data.len(), out.display());
    Ok(())
}

fn verify(path: &Path, deep: bool, json: bool) -> Result<()> {
    let fs = Filesystem::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;
    let report = fs.verify_image(deep)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize output")?
        );
        return Ok(());
    }

    println!(
        "verified {} sections across {} partitions{}",
        report.sections_checked,
        report.partitions.len(),
        if deep { " (deep)" } else { "" },
    );
    for partition in &report.partitions {
        println!(
            "partition {}: sections={} signature={}",
            partition.minor, partition.sections, partition.signature
        );
    }
    Ok(())
}

fn decrypt(
    path: &Path,
    minor: u32,
    boot_id: Option<&str>,
    slot: usize,
    out: &Path,
) -> Result<()> {
    let fs = Filesystem::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;

    match decrypt_partition(&fs, minor, boot_id, slot)? {
        DecryptedPartition::Plain(plaintext) => {
            std::fs::write(out, &plaintext)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("wrote {} decrypted bytes to {}", plaintext.len(), out.display());
        }
        DecryptedPartition::Luks { key, container } => {
            // LUKS containers are opened externally; hand over the raw
            // container and the unwrapped master key.
            std::fs::write(out, &container)
                .with_context(|| format!("failed to write {}", out.display()))?;
            let key_path = out.with_extension("key");
            std::fs::write(&key_path, key.as_bytes())
                .with_context(|| format!("failed to write {}", key_path.display()))?;
            println!(
                "partition {minor} is a LUKS container: wrote {} bytes to {} and the master key to {}",
                container.len(),
                out.display(),
                key_path.display(),
            );
            println!(
                "open it with: cryptsetup --master-key-file={} open {} <name>",
                key_path.display(),
                out.display(),
            );
        }
    }
    Ok(())
}
