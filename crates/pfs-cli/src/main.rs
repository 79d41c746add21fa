#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pfs_image::{BuildSummary, FileImageSink, ImageProps, build_image, calculate_size};
use pfs_tree::{FsTree, HostFileContents, NodeId};
use pfs_types::{BlockSize, EKPFS_SIZE, SEED_SIZE};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "pfsforge", about = "PfsForge — PFS disk image builder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Directory that becomes the image root.
    root: PathBuf,
    /// Sign every block with HMAC-SHA256 (requires --ekpfs).
    #[arg(long)]
    sign: bool,
    /// Encrypt data sectors with XTS-AES-128 (requires --ekpfs).
    #[arg(long)]
    encrypt: bool,
    /// EKPFS master key, 64 hex digits.
    #[arg(long)]
    ekpfs: Option<String>,
    /// Image seed, 32 hex digits (defaults to zeros).
    #[arg(long)]
    seed: Option<String>,
    /// Timestamp applied to every inode, seconds since the Unix epoch.
    #[arg(long, default_value_t = 0)]
    timestamp: u64,
    /// PFS block size in bytes.
    #[arg(long, default_value_t = 65536)]
    block_size: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Build a PFS image from a directory tree.
    Build {
        #[command(flatten)]
        args: BuildArgs,
        /// Output image path.
        out: PathBuf,
        /// Output the build summary in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Compute the image size a build would produce, without writing.
    Size {
        #[command(flatten)]
        args: BuildArgs,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct BuildOutput {
    image: String,
    image_len: u64,
    ndblock: u64,
    inode_count: u64,
    signed: bool,
    encrypted: bool,
}

#[derive(Debug, Serialize)]
struct SizeOutput {
    image_len: u64,
    blocks: u64,
    block_size: u32,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Build { args, out, json } => build_cmd(&args, &out, json),
        Command::Size { args, json } => size_cmd(&args, json),
    }
}

fn parse_hex_key<const N: usize>(value: &str, what: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(value).with_context(|| format!("{what} is not valid hex"))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("{what} must be {N} bytes, got {len}"))
}

fn props_from_args(args: &BuildArgs) -> Result<ImageProps> {
    let ekpfs = args
        .ekpfs
        .as_deref()
        .map(|hex| parse_hex_key::<EKPFS_SIZE>(hex, "--ekpfs"))
        .transpose()?;
    let seed = args
        .seed
        .as_deref()
        .map(|hex| parse_hex_key::<SEED_SIZE>(hex, "--seed"))
        .transpose()?
        .unwrap_or([0; SEED_SIZE]);

    if (args.sign || args.encrypt) && ekpfs.is_none() {
        bail!("--sign and --encrypt require --ekpfs");
    }

    Ok(ImageProps {
        block_size: BlockSize::new(args.block_size)
            .map_err(|err| anyhow::anyhow!("--block-size: {err}"))?,
        sign: args.sign,
        encrypt: args.encrypt,
        ekpfs,
        seed,
        file_time: args.timestamp,
    })
}

/// Recursively mirror a host directory into the tree. Entries are added
/// in name order so rebuilds of the same directory are byte-identical.
fn populate(tree: &mut FsTree, dir: NodeId, path: &Path) -> Result<()> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("failed to enumerate {}", path.display()))?;
    entries.sort_by_key(fs::DirEntry::file_name);

    for entry in entries {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            bail!("non-UTF-8 file name in {}", path.display());
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let child = tree
                .add_directory(dir, name)
                .with_context(|| format!("adding directory {}", entry.path().display()))?;
            populate(tree, child, &entry.path())?;
        } else if file_type.is_file() {
            let size = entry.metadata()?.len();
            tree.add_file(
                dir,
                name,
                size,
                Box::new(HostFileContents::new(entry.path())),
            )
            .with_context(|| format!("adding file {}", entry.path().display()))?;
        } else {
            eprintln!("skipping {} (not a regular file)", entry.path().display());
        }
    }
    Ok(())
}

fn tree_from_root(root: &Path) -> Result<FsTree> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let mut tree = FsTree::new();
    let image_root = tree.root();
    populate(&mut tree, image_root, root)?;
    Ok(tree)
}

fn build_cmd(args: &BuildArgs, out: &Path, json: bool) -> Result<()> {
    let props = props_from_args(args)?;
    let mut tree = tree_from_root(&args.root)?;

    let mut sink = FileImageSink::create(out)
        .with_context(|| format!("failed to create {}", out.display()))?;
    let summary: BuildSummary = build_image(&props, &mut tree, &mut sink)
        .with_context(|| format!("failed to build image from {}", args.root.display()))?;
    sink.sync().context("failed to sync image to disk")?;

    let output = BuildOutput {
        image: out.display().to_string(),
        image_len: summary.image_len,
        ndblock: summary.ndblock,
        inode_count: summary.inode_count,
        signed: summary.signed,
        encrypted: summary.encrypted,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!(
            "wrote {}: {} bytes, {} blocks, {} inodes{}{}",
            output.image,
            output.image_len,
            output.ndblock,
            output.inode_count,
            if output.signed { ", signed" } else { "" },
            if output.encrypted { ", encrypted" } else { "" },
        );
    }
    Ok(())
}

fn size_cmd(args: &BuildArgs, json: bool) -> Result<()> {
    let props = props_from_args(args)?;
    let tree = tree_from_root(&args.root)?;

    let image_len = calculate_size(&props, &tree)
        .with_context(|| format!("failed to size image for {}", args.root.display()))?;
    let output = SizeOutput {
        image_len,
        blocks: image_len / u64::from(args.block_size),
        block_size: args.block_size,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!(
            "{} bytes ({} blocks of {})",
            output.image_len, output.blocks, output.block_size
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_for(root: &Path) -> BuildArgs {
        BuildArgs {
            root: root.to_path_buf(),
            sign: false,
            encrypt: false,
            ekpfs: None,
            seed: None,
            timestamp: 0,
            block_size: 65536,
        }
    }

    #[test]
    fn hex_keys_parse_and_reject_bad_lengths() {
        let ekpfs = parse_hex_key::<32>(&"ab".repeat(32), "--ekpfs").unwrap();
        assert_eq!(ekpfs[0], 0xAB);
        assert!(parse_hex_key::<32>("abcd", "--ekpfs").is_err());
        assert!(parse_hex_key::<16>("zz", "--seed").is_err());
    }

    #[test]
    fn sign_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = args_for(dir.path());
        args.sign = true;
        assert!(props_from_args(&args).is_err());
    }

    #[test]
    fn tree_mirrors_host_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.bin"), b"abc").unwrap();
        fs::write(dir.path().join("top.txt"), b"top").unwrap();

        let tree = tree_from_root(dir.path()).unwrap();
        let files: Vec<String> = tree
            .files_sorted_by_path()
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        assert_eq!(files, vec!["/sub/inner.bin", "/top.txt"]);
    }

    #[test]
    fn build_and_size_agree_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.bin"), vec![7_u8; 100]).unwrap();

        let args = args_for(&root);
        let out = dir.path().join("image.pfs");
        build_cmd(&args, &out, false).unwrap();

        let props = props_from_args(&args).unwrap();
        let tree = tree_from_root(&args.root).unwrap();
        let predicted = calculate_size(&props, &tree).unwrap();
        assert_eq!(fs::metadata(&out).unwrap().len(), predicted);
    }
}
