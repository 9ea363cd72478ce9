//! Amp Plugin Host
//!
//! Minimal host that loads the scripted amplifier through its descriptor,
//! feeds it ramps of increasing length from a separate audio thread and
//! reports what came out.

use std::ffi::{CString, c_void};
use std::path::PathBuf;
use std::ptr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use amp::PortIndex;
use amp::lv2::{LV2Descriptor, LV2Handle, lv2_descriptor};

/// Scripted amplifier test host
#[derive(Parser, Debug)]
#[command(name = "amp-plugin-host")]
#[command(about = "Drive the scripted amplifier plugin", long_about = None)]
struct Args {
    /// Plugin bundle directory (contains amp.js and optionally amp.toml)
    #[arg(short, long, default_value = concat!(env!("CARGO_MANIFEST_DIR"), "/../amp/bundle"))]
    bundle: PathBuf,

    /// Gain control value in dB
    #[arg(short, long, default_value = "3.2", allow_hyphen_values = true)]
    gain: f32,

    /// Samples in the first block; block `i` has `(i + 1) * block_size` samples
    #[arg(long, default_value = "20")]
    block_size: usize,

    /// Number of `run` calls
    #[arg(short = 'n', long, default_value = "10")]
    iterations: usize,

    /// Sample rate passed to `instantiate`
    #[arg(long, default_value = "48000")]
    sample_rate: f64,

    /// Print a JSON summary instead of a table
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Serialize)]
struct BlockReport {
    index: usize,
    samples: usize,
    coefficient: f32,
    peak_in: f32,
    peak_out: f32,
    elapsed_us: u128,
}

#[derive(Debug, Serialize)]
struct Summary {
    bundle: PathBuf,
    gain: f32,
    blocks: Vec<BlockReport>,
    total_elapsed_ms: u128,
}

/// A live plugin instance. Deactivated and cleaned up on drop.
struct Instance {
    descriptor: &'static LV2Descriptor,
    handle: LV2Handle,
}

// LV2 lets the host move an instance between threads as long as calls on it
// are not concurrent.
unsafe impl Send for Instance {}

impl Instance {
    fn instantiate(bundle: &std::path::Path, sample_rate: f64) -> Result<Self> {
        let descriptor = unsafe { lv2_descriptor(0).as_ref() }.context("plugin exports no descriptor")?;
        let instantiate = descriptor.instantiate.context("descriptor has no instantiate")?;

        let path = CString::new(bundle.to_string_lossy().into_owned())
            .context("bundle path contains a NUL byte")?;
        let handle = unsafe { instantiate(descriptor, sample_rate, path.as_ptr(), ptr::null()) };
        if handle.is_null() {
            bail!("instantiate failed for {}", bundle.display());
        }
        Ok(Self { descriptor, handle })
    }

    fn connect(&self, port: PortIndex, data: *mut c_void) {
        if let Some(connect_port) = self.descriptor.connect_port {
            unsafe { connect_port(self.handle, port as u32, data) };
        }
    }

    fn activate(&self) {
        if let Some(activate) = self.descriptor.activate {
            unsafe { activate(self.handle) };
        }
    }

    fn run(&self, n_samples: u32) {
        if let Some(run) = self.descriptor.run {
            unsafe { run(self.handle, n_samples) };
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some(deactivate) = self.descriptor.deactivate {
                deactivate(self.handle);
            }
            if let Some(cleanup) = self.descriptor.cleanup {
                cleanup(self.handle);
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("amp=info"));
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting amp plugin host v{}", env!("CARGO_PKG_VERSION"));

    let started = Instant::now();
    let instance = Instance::instantiate(&args.bundle, args.sample_rate)?;
    instance.activate();

    let gain = args.gain;
    let block_size = args.block_size;
    let iterations = args.iterations;
    let audio = std::thread::Builder::new()
        .name("amp-audio".to_string())
        .spawn(move || run_blocks(instance, gain, block_size, iterations))
        .context("failed to spawn audio thread")?;

    let blocks = audio
        .join()
        .map_err(|_| anyhow::anyhow!("audio thread panicked"))?;

    let summary = Summary {
        bundle: args.bundle,
        gain: args.gain,
        blocks,
        total_elapsed_ms: started.elapsed().as_millis(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_table(&summary);
    }
    Ok(())
}

fn run_blocks(instance: Instance, gain: f32, block_size: usize, iterations: usize) -> Vec<BlockReport> {
    let mut gain = Box::new(gain);
    instance.connect(PortIndex::Gain, (&raw mut *gain).cast());

    let mut reports = Vec::with_capacity(iterations);
    for i in 0..iterations {
        let samples = block_size * (i + 1);
        let mut input: Vec<f32> = (0..samples).map(|j| ((i + 1) * (j + 1)) as f32).collect();
        let mut output = vec![0.0f32; samples];
        instance.connect(PortIndex::Input, input.as_mut_ptr().cast());
        instance.connect(PortIndex::Output, output.as_mut_ptr().cast());

        let start = Instant::now();
        instance.run(samples as u32);
        let elapsed = start.elapsed();

        reports.push(report(i, &input, &output, elapsed));
    }

    // Ports must not dangle once the buffers go away.
    instance.connect(PortIndex::Input, ptr::null_mut());
    instance.connect(PortIndex::Output, ptr::null_mut());
    drop(instance);
    reports
}

fn report(index: usize, input: &[f32], output: &[f32], elapsed: Duration) -> BlockReport {
    let peak = |buf: &[f32]| buf.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    let coefficient = match (input.first(), output.first()) {
        (Some(&i), Some(&o)) if i != 0.0 => o / i,
        _ => 0.0,
    };
    BlockReport {
        index,
        samples: input.len(),
        coefficient,
        peak_in: peak(input),
        peak_out: peak(output),
        elapsed_us: elapsed.as_micros(),
    }
}

fn print_table(summary: &Summary) {
    println!("bundle: {}", summary.bundle.display());
    println!("gain:   {} dB", summary.gain);
    println!("{:>5} {:>8} {:>12} {:>12} {:>12} {:>10}", "block", "samples", "coef", "peak in", "peak out", "us");
    for block in &summary.blocks {
        println!(
            "{:>5} {:>8} {:>12.6} {:>12.3} {:>12.3} {:>10}",
            block.index, block.samples, block.coefficient, block.peak_in, block.peak_out, block.elapsed_us
        );
    }
    println!("total: {} ms", summary.total_elapsed_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["amp-plugin-host"]);
        assert_eq!(args.gain, 3.2);
        assert_eq!(args.block_size, 20);
        assert_eq!(args.iterations, 10);
        assert!(!args.json);
    }

    #[test]
    fn test_negative_gain_flag() {
        let args = Args::parse_from(["amp-plugin-host", "--gain", "-3", "--json"]);
        assert_eq!(args.gain, -3.0);
        assert!(args.json);
    }

    #[test]
    fn test_report_coefficient() {
        let report = report(0, &[2.0, 4.0], &[1.0, 2.0], Duration::from_micros(5));
        assert_eq!(report.coefficient, 0.5);
        assert_eq!(report.peak_in, 4.0);
        assert_eq!(report.peak_out, 2.0);
        assert_eq!(report.samples, 2);
    }

    #[test]
    fn test_drives_bundled_plugin() {
        let bundle = PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/../amp/bundle"));
        let instance = Instance::instantiate(&bundle, 48_000.0).unwrap();
        instance.activate();

        let blocks = run_blocks(instance, -3.0, 4, 3);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].samples, 12);
        for block in &blocks {
            assert!((block.coefficient - 10f32.powf(0.15)).abs() < 1e-5);
        }
    }
}
