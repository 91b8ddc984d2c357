use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use colored::Colorize;
use sdc_block::{seek_to_first_block, BlockFile, Compression, Padding, Payload, WrittenBlock};
use sdc_context::DEFAULT_VERSION;
use sdc_identity::ObjectRef;
use sdc_manager::{BlockConfig, CompressionPolicy, Manager, ManagerConfig};
use serde::Serialize;
use tracing::debug;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Info(args) => cmd_info(args, &config, cli.format),
        Command::Verify(args) => cmd_verify(args, &config, cli.format),
        Command::Extract(args) => cmd_extract(args, &config),
        Command::Pack(args) => cmd_pack(args, &config, cli.format),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<BlockConfig> {
    match path {
        Some(path) => BlockConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(BlockConfig::default()),
    }
}

fn open_document(path: &Path, config: &BlockConfig) -> anyhow::Result<Manager> {
    let file = BlockFile::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut manager = Manager::new(ManagerConfig::from(config.clone()));
    if seek_to_first_block(&file, config.io_block_size)?.is_some() {
        manager.read(&file, false)?;
    }
    Ok(manager)
}

#[derive(Debug, Serialize)]
pub struct BlockSummary {
    pub index: usize,
    pub offset: u64,
    pub streamed: bool,
    pub compression: String,
    pub allocated_size: u64,
    pub used_size: u64,
    pub data_size: u64,
    pub checksum: Option<String>,
}

pub fn block_summaries(path: &Path, config: &BlockConfig) -> anyhow::Result<Vec<BlockSummary>> {
    let manager = open_document(path, config)?;
    let blocks = manager.blocks();
    let mut out = Vec::with_capacity(blocks.len());
    for index in 0..blocks.len() {
        let offset = blocks.with_block(index, |b| b.offset())?;
        let header = blocks.header(index)?;
        out.push(BlockSummary {
            index,
            offset,
            streamed: header.is_streamed(),
            compression: header.compression.label().to_string(),
            allocated_size: header.allocated_size,
            used_size: header.used_size,
            data_size: header.data_size,
            checksum: header.has_checksum().then(|| hex::encode(header.checksum)),
        });
    }
    Ok(out)
}

fn cmd_info(args: InfoArgs, config: &BlockConfig, format: OutputFormat) -> anyhow::Result<()> {
    let summaries = block_summaries(&args.file, config)?;
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    println!("{} ({} blocks)", args.file.display().to_string().bold(), summaries.len());
    for s in &summaries {
        let kind = if s.streamed { "streamed".yellow() } else { "internal".normal() };
        println!(
            "  {} @{}  {}  {}  used {} / alloc {}  data {}",
            format!("#{}", s.index).yellow().bold(),
            s.offset,
            kind,
            s.compression.cyan(),
            s.used_size,
            s.allocated_size,
            s.data_size,
        );
        if let Some(sum) = &s.checksum {
            println!("    md5 {}", sum.dimmed());
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct VerifyOutcome {
    pub index: usize,
    pub ok: bool,
    pub error: Option<String>,
}

pub fn verify_blocks(path: &Path, config: &BlockConfig) -> anyhow::Result<Vec<VerifyOutcome>> {
    let config = BlockConfig {
        validate_checksums: true,
        memmap: false,
        ..config.clone()
    };
    let manager = open_document(path, &config)?;
    let blocks = manager.blocks();
    Ok((0..blocks.len())
        .map(|index| match blocks.data(index) {
            Ok(_) => VerifyOutcome {
                index,
                ok: true,
                error: None,
            },
            Err(e) => VerifyOutcome {
                index,
                ok: false,
                error: Some(e.to_string()),
            },
        })
        .collect())
}

fn cmd_verify(args: VerifyArgs, config: &BlockConfig, format: OutputFormat) -> anyhow::Result<()> {
    let outcomes = verify_blocks(&args.file, config)?;
    let failed = outcomes.iter().filter(|o| !o.ok).count();
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        for o in &outcomes {
            match &o.error {
                None => println!("  {} block {}", "✓".green(), o.index),
                Some(e) => println!("  {} block {}: {}", "✗".red(), o.index, e),
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} blocks failed verification", outcomes.len());
    }
    if format == OutputFormat::Text {
        println!("{} {} blocks verified", "✓".green().bold(), outcomes.len());
    }
    Ok(())
}

fn cmd_extract(args: ExtractArgs, config: &BlockConfig) -> anyhow::Result<()> {
    let manager = open_document(&args.file, config)?;
    let data = manager.blocks().data(args.index)?;
    fs::write(&args.output, &data[..])
        .with_context(|| format!("writing {}", args.output.display()))?;
    println!(
        "{} Extracted block {} ({} bytes) to {}",
        "✓".green().bold(),
        args.index,
        data.len(),
        args.output.display().to_string().bold()
    );
    Ok(())
}

/// Write every input file as one block of a new document at `output`.
pub fn pack_files(
    inputs: &[PathBuf],
    output: &Path,
    config: &BlockConfig,
    padding: Padding,
    include_index: bool,
) -> anyhow::Result<Vec<WrittenBlock>> {
    let file = BlockFile::create(output).with_context(|| format!("creating {}", output.display()))?;
    file.write_at(0, format!("#SDC {DEFAULT_VERSION}\n").as_bytes())?;

    let payloads = inputs
        .iter()
        .map(|path| {
            fs::read(path)
                .map(Payload::from)
                .with_context(|| format!("reading {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut manager = Manager::new(ManagerConfig::from(config.clone()));
    let mut tx = manager.open_write_transaction(file, false);
    for payload in &payloads {
        let options = tx.resolved_options(payload)?;
        let slot = tx.make_write_block(payload, &options, ObjectRef::object(payload))?;
        debug!(slot = ?slot, compression = %options.compression, "packed input");
    }
    Ok(tx.write(padding, include_index)?)
}

fn cmd_pack(args: PackArgs, config: &BlockConfig, format: OutputFormat) -> anyhow::Result<()> {
    let mut config = config.clone();
    if let Some(codec) = &args.compression {
        let codec: Compression = codec.parse()?;
        config.compression = CompressionPolicy::Codec(codec);
    }
    let padding = if args.pad { Padding::Default } else { Padding::None };
    let written = pack_files(&args.inputs, &args.output, &config, padding, !args.no_index)?;

    if format == OutputFormat::Json {
        let offsets: Vec<u64> = written.iter().map(|w| w.offset).collect();
        println!("{}", serde_json::json!({ "output": args.output, "offsets": offsets }));
        return Ok(());
    }
    println!(
        "{} Packed {} blocks into {}",
        "✓".green().bold(),
        written.len(),
        args.output.display().to_string().bold()
    );
    for (input, block) in args.inputs.iter().zip(&written) {
        println!(
            "  {} @{}  {}",
            input.display(),
            block.offset,
            block.header.compression.label().cyan()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(dir: &Path, contents: &[&[u8]]) -> Vec<PathBuf> {
        contents
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                let path = dir.join(format!("input{i}.bin"));
                fs::write(&path, bytes).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn pack_then_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let files = inputs(dir.path(), &[b"first payload", &[0u8; 2000]]);
        let out = dir.path().join("packed.sdc");
        let config = BlockConfig {
            compression: CompressionPolicy::Codec(Compression::Zlib),
            ..BlockConfig::default()
        };
        let written = pack_files(&files, &out, &config, Padding::None, true).unwrap();
        assert_eq!(written.len(), 2);

        let summaries = block_summaries(&out, &BlockConfig::default()).unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].offset, written[0].offset);
        assert_eq!(summaries[1].data_size, 2000);
        assert!(summaries[1].used_size < 2000);
        assert!(summaries.iter().all(|s| s.compression == Compression::Zlib.label()));
        assert!(summaries.iter().all(|s| s.checksum.is_some()));

        let manager = open_document(&out, &BlockConfig::default()).unwrap();
        assert_eq!(&manager.blocks().data(0).unwrap()[..], b"first payload");
    }

    #[test]
    fn verify_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let files = inputs(dir.path(), &[b"intact", b"will be damaged"]);
        let out = dir.path().join("packed.sdc");
        let written = pack_files(&files, &out, &BlockConfig::default(), Padding::None, true).unwrap();

        let outcomes = verify_blocks(&out, &BlockConfig::default()).unwrap();
        assert!(outcomes.iter().all(|o| o.ok));

        let mut bytes = fs::read(&out).unwrap();
        bytes[written[1].data_offset as usize] ^= 0xff;
        fs::write(&out, bytes).unwrap();
        let outcomes = verify_blocks(&out, &BlockConfig::default()).unwrap();
        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
    }

    #[test]
    fn verify_reports_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = inputs(dir.path(), &[&[5u8; 4000], &[6u8; 4000]]);
        let out = dir.path().join("packed.sdc");
        let written = pack_files(&files, &out, &BlockConfig::default(), Padding::None, true).unwrap();

        let mut bytes = fs::read(&out).unwrap();
        bytes.truncate(written[1].data_offset as usize + 10);
        fs::write(&out, bytes).unwrap();
        let err = verify_blocks(&out, &BlockConfig::default()).unwrap_err();
        assert!(format!("{err:#}").contains("overruns end of file"), "{err:#}");
    }

    #[test]
    fn document_without_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.sdc");
        fs::write(&path, b"#SDC 1.1.0\n{}\n").unwrap();
        assert!(block_summaries(&path, &BlockConfig::default()).unwrap().is_empty());
    }
}
