use anyhow::{Context, Result, bail};
use clap::Parser;
use pdf_x_bridge::core::{
    BaseStream, FetchOptions, FileRangeFetcher, ProgressiveStream, PumpDriver,
};
use pdf_x_bridge::retry_on_try_later;
use std::sync::Arc;
use std::time::Instant;

/// Progressive stream inspector
///
/// Reads a document block by block through a progressive stream and reports
/// how the blocks were fetched.
#[derive(Parser, Debug)]
#[command(name = "fetch-inspect", version)]
struct Cli {
    /// Local path, or an http(s) URL when built with the `async` feature
    source: String,

    /// Block size in bytes (power of two between 1 KiB and 16 MiB)
    #[arg(long, default_value_t = 65536)]
    block_size: usize,

    /// Only fetch blocks that reads demand
    #[arg(long)]
    no_prefetch: bool,

    /// Number of leading bytes to dump
    #[arg(long, default_value_t = 64)]
    head: usize,
}

struct Report {
    length: usize,
    block_size: usize,
    blocks_loaded: usize,
    fetched_blocks: Option<usize>,
    head: Vec<u8>,
    elapsed_ms: u128,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let options = FetchOptions::default()
        .with_block_size(cli.block_size)
        .with_prefetch(!cli.no_prefetch);

    let report = if is_remote(&cli.source) {
        inspect_remote(&cli, &options)?
    } else {
        inspect_file(&cli, &options)?
    };

    print_report(&cli.source, &report);
    Ok(())
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn inspect_file(cli: &Cli, options: &FetchOptions) -> Result<Report> {
    let started = Instant::now();
    let length = FileRangeFetcher::content_length(&cli.source)
        .with_context(|| format!("cannot stat {}", cli.source))?;

    let driver = Arc::new(PumpDriver::new(FileRangeFetcher::new()));
    let mut stream = ProgressiveStream::open(driver.clone(), cli.source.clone(), length, options)?;

    let mut head = Vec::with_capacity(cli.head.min(length));
    let mut buf = vec![0u8; options.block_size];
    loop {
        let n = retry_on_try_later!(driver.pump()?, stream.read_into(&mut buf))?;
        if n == 0 {
            break;
        }
        let wanted = cli.head.saturating_sub(head.len()).min(n);
        head.extend_from_slice(&buf[..wanted]);
    }

    if !stream.is_fully_loaded() {
        bail!("stream ended before every block was loaded");
    }

    Ok(Report {
        length,
        block_size: options.block_size,
        blocks_loaded: stream.num_blocks_loaded()?,
        fetched_blocks: Some(driver.fetched_blocks()),
        head,
        elapsed_ms: started.elapsed().as_millis(),
    })
}

#[cfg(feature = "async")]
fn inspect_remote(cli: &Cli, options: &FetchOptions) -> Result<Report> {
    use pdf_x_bridge::core::{
        AsyncProgressiveStream, TokioFetchDriver, default_client, probe_content_length,
    };

    let runtime = tokio::runtime::Runtime::new().context("cannot start tokio runtime")?;
    runtime.block_on(async {
        let started = Instant::now();
        let client = default_client()?;
        let length = probe_content_length(&client, &cli.source)
            .await
            .with_context(|| format!("cannot probe {}", cli.source))?;

        let driver = Arc::new(TokioFetchDriver::with_client(
            client,
            tokio::runtime::Handle::current(),
        ));
        let mut stream = AsyncProgressiveStream::open(driver, cli.source.clone(), length, options)?;
        let data = stream.read_to_end().await?;

        Ok::<_, anyhow::Error>(Report {
            length,
            block_size: options.block_size,
            blocks_loaded: stream.get_mut().num_blocks_loaded()?,
            fetched_blocks: None,
            head: data[..cli.head.min(data.len())].to_vec(),
            elapsed_ms: started.elapsed().as_millis(),
        })
    })
}

#[cfg(not(feature = "async"))]
fn inspect_remote(cli: &Cli, _options: &FetchOptions) -> Result<Report> {
    bail!(
        "{} is a URL; rebuild with `--features async` to fetch over HTTP",
        cli.source
    )
}

fn print_report(source: &str, report: &Report) {
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║           Progressive Fetch Inspector                     ║");
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!("\nSource: {}\n", source);

    println!("═══════════════ STREAM ═══════════════");
    println!("Length: {}", format_size(report.length));
    println!("Block Size: {}", format_size(report.block_size));
    println!("Blocks Loaded: {}", report.blocks_loaded);
    if let Some(fetched) = report.fetched_blocks {
        println!("Block Requests Served: {}", fetched);
    }
    println!("Elapsed: {} ms", report.elapsed_ms);
    println!();

    if !report.head.is_empty() {
        println!("═══════════════ HEAD ═══════════════");
        print_hexdump(&report.head);
        println!();
    }
}

fn format_size(size: usize) -> String {
    if size < 1024 {
        format!("{} B", size)
    } else if size < 1024 * 1024 {
        format!("{:.2} KB", size as f64 / 1024.0)
    } else if size < 1024 * 1024 * 1024 {
        format!("{:.2} MB", size as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", size as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn print_hexdump(bytes: &[u8]) {
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!("{:08x}  {:<47}  |{}|", row * 16, hex.join(" "), ascii);
    }
}
