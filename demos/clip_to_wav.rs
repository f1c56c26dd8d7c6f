use clap::Parser;
use log::info;
use ninjam_rust::{
    common::box_error::BoxError,
    sound::codec::{AudioDecoder, PcmDecoder},
};
use simple_error::bail;
use std::fs;

/// Convert an archived PCM interval into a wave file
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Archived interval (.pcm)
    #[arg(short, long)]
    in_file: String,

    /// Filename for the output
    #[arg(short, long)]
    out_file: String,
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let data = fs::read(&args.in_file)?;
    let mut decoder = PcmDecoder::new();
    let mut samples = vec![];
    decoder.decode(&data, &mut samples);
    if decoder.channels() == 0 {
        bail!("{} is too short to be a PCM interval", args.in_file);
    }

    let spec = hound::WavSpec {
        channels: decoder.channels() as u16,
        sample_rate: decoder.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&args.out_file, spec)?;
    for s in samples.iter() {
        writer.write_sample((s * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    info!(
        "wrote {} frames at {} Hz to {}",
        samples.len() / decoder.channels(),
        decoder.sample_rate(),
        args.out_file
    );
    Ok(())
}
