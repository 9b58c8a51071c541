//! gralloc-probe
//!
//! Exercises the allocator end to end: opens both endpoints, fills display
//! sized buffers with a test pattern through CPU locks, posts them to the
//! frame endpoint and prints the handoff counters.

use anyhow::{Context, Result, bail};
use gralloc_gbm::{BufferUsage, Config, GrallocModule, Region, logging};
use std::path::PathBuf;
use tracing::info;

struct Args {
    config: Option<PathBuf>,
    frames: u32,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        frames: 3,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--frames" | "-n" => {
                let count = iter.next().context("--frames needs a count")?;
                args.frames = count
                    .parse()
                    .with_context(|| format!("invalid frame count {:?}", count))?;
            }
            "--help" | "-h" => {
                println!("usage: gralloc-probe [--config PATH] [--frames N]");
                std::process::exit(0);
            }
            other => bail!("unknown argument {:?}", other),
        }
    }
    Ok(args)
}

/// Diagonal stripes, shifted per frame so consecutive posts differ
fn fill(pixels: &mut [u8], stride: usize, row_bytes: usize, frame: u32) {
    for (y, row) in pixels.chunks_mut(stride).enumerate() {
        let end = row_bytes.min(row.len());
        for (x, byte) in row[..end].iter_mut().enumerate() {
            *byte = (x + y + frame as usize * 16) as u8;
        }
    }
}

fn main() -> Result<()> {
    logging::init("gralloc_gbm=debug,gralloc_probe=info,info");

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let module = GrallocModule::new(config);
    let alloc = module.open_alloc().context("Failed to open allocation endpoint")?;
    let fb = module.open_framebuffer().context("Failed to open display endpoint")?;
    let geometry = *fb.geometry();
    info!(
        "Probing {}x{} {:?}, {} frames",
        geometry.width, geometry.height, geometry.format, args.frames
    );

    let usage = BufferUsage::SW_WRITE_OFTEN | BufferUsage::HW_FB;
    for frame in 0..args.frames {
        let (buffer, stride_px) = alloc
            .alloc(geometry.width, geometry.height, geometry.format, usage)
            .context("Failed to allocate frame")?;
        let handle = buffer.handle();
        let info = handle.info();

        let mut mapping = module.lock(handle, BufferUsage::SW_WRITE_OFTEN, Region::full(info))?;
        let stride = mapping.stride();
        let row_bytes = (info.width * info.bytes_per_pixel()) as usize;
        // SAFETY: the buffer stays locked until the unlock below.
        fill(unsafe { mapping.as_mut_slice() }, stride, row_bytes, frame);
        module.unlock(handle)?;

        fb.post(handle)?;
        info!("Posted frame {} ({:?}, stride {} px)", frame, handle.id(), stride_px);
        alloc.free(buffer)?;
    }

    // Drains queued frames in worker mode
    let stats = fb.close();

    println!("posted              {}", stats.posted);
    println!("acked               {}", stats.acked);
    println!("connect_unreachable {}", stats.connect_unreachable);
    println!("send_incomplete     {}", stats.send_incomplete);
    println!("timed_out           {}", stats.timed_out);
    println!("reply_missing       {}", stats.reply_missing);
    println!("dropped             {}", stats.dropped);

    alloc.close();
    Ok(())
}
