//! motion_probe - run the motion detector over a raw I420 file
//!
//! Prints one line per frame with the calibration state and motion boxes, so
//! motion frame ranges of reference clips can be checked by eye or by script.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

use nvr_pipeline::config::MotionSettings;
use nvr_pipeline::frame::luma_plane;
use nvr_pipeline::{BoundingBox, FrameShape, MotionDetector, PtzMotorState};

#[derive(Parser, Debug)]
#[command(author, version, about = "Print motion boxes for each frame of a raw YUV 4:2:0 file")]
struct Args {
    /// Raw I420 file (frames back to back, no headers).
    input: PathBuf,

    #[arg(long)]
    width: u32,

    #[arg(long)]
    height: u32,

    /// Motion frame height.
    #[arg(long, default_value_t = 100)]
    frame_height: u32,

    /// Pixel difference threshold.
    #[arg(long, default_value_t = 30)]
    threshold: u8,

    /// Minimum contour area.
    #[arg(long, default_value_t = 10)]
    contour_area: u32,

    /// Skip contrast normalisation.
    #[arg(long)]
    no_contrast: bool,

    /// Exclusion polygon "x1,y1,x2,y2,..." (repeatable).
    #[arg(long)]
    mask: Vec<String>,

    /// Emit JSON lines instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct FrameReport<'a> {
    frame: u64,
    calibrating: bool,
    boxes: &'a [BoundingBox],
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.width == 0 || args.height == 0 || args.width % 2 != 0 || args.height % 2 != 0 {
        return Err(anyhow!("width and height must be even and non-zero"));
    }

    let shape = FrameShape::new(args.width, args.height);
    let settings = MotionSettings {
        threshold: args.threshold,
        contour_area: args.contour_area,
        frame_height: args.frame_height,
        improve_contrast: !args.no_contrast,
        mask: args.mask.clone(),
        ..MotionSettings::default()
    };
    let mut detector = MotionDetector::new(shape, settings, Arc::new(PtzMotorState::new()))?;

    let file = File::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    let mut reader = BufReader::new(file);
    let mut frame = vec![0u8; shape.yuv_size()];
    let mut index = 0u64;
    loop {
        match reader.read_exact(&mut frame) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("read frame"),
        }
        let boxes = detector.detect(luma_plane(&frame, &shape)?);
        let calibrating = detector.is_calibrating();
        if args.json {
            let report = FrameReport {
                frame: index,
                calibrating,
                boxes: &boxes,
            };
            println!("{}", serde_json::to_string(&report)?);
        } else {
            let listed: Vec<String> = boxes
                .iter()
                .map(|b| format!("({},{},{},{})", b.x1, b.y1, b.x2, b.y2))
                .collect();
            println!(
                "frame {:>6} calibrating={} boxes=[{}]",
                index,
                calibrating,
                listed.join(" ")
            );
        }
        index += 1;
    }
    log::info!("{} frame(s) processed", index);
    Ok(())
}
