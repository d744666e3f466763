/*
    QICTape

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------
*/

//! QICTape headless front end.
//!
//! Builds a simulated drive with a freshly formatted cartridge, opens a session on it and
//! runs the exercise described by the `[exercise]` table of `qictape.toml`: write a run of
//! segments, record file marks, inject data CRC errors, read everything back and seek by
//! file mark. The history record is printed at the end.

#![forbid(unsafe_code)]

use anyhow::{bail, Context};
use rand::{rngs::StdRng, Rng, SeedableRng};

use ftape_config::{ConfigFileParams, Exercise, DEFAULT_CONFIG_FILE};
use ftape_core::{
    device_types::sector_map::SECTORS_PER_SEGMENT,
    sim::{SimulatedFdc, TapeMedia},
    TapeSession,
};

fn main() {
    env_logger::init();

    let config = match ftape_config::read_config_file(DEFAULT_CONFIG_FILE) {
        Ok(config) => config,
        Err(e) => match e.downcast_ref::<std::io::Error>() {
            Some(e) => {
                eprintln!("Error reading configuration file:\n{}", e);
                std::process::exit(1);
            }
            None => {
                eprintln!(
                    "Failed to parse configuration file. There may be a typo or otherwise invalid toml:\n{}",
                    e
                );
                std::process::exit(1);
            }
        },
    };

    if let Err(e) = run(config) {
        log::error!("Exercise failed: {:#}", e);
        std::process::exit(1);
    }
}

fn run(config: ConfigFileParams) -> anyhow::Result<()> {
    let ConfigFileParams { session, sim, exercise } = config;

    let media = TapeMedia::formatted(sim.standard, sim.length, &[]).context("formatting cartridge")?;
    let mut rng = StdRng::seed_from_u64(sim.seed);
    let (fdc, events) = SimulatedFdc::new(sim, media);
    let mut session = TapeSession::open(fdc, events, session).context("opening session")?;

    let drive = session.drive_state();
    println!(
        "Drive: {} (vendor {:04X}, rom {:02X}), {} {} cartridge at {}, wake-up {}",
        drive.vendor.map(|v| v.name).unwrap_or("unknown"),
        drive.vendor_id,
        drive.rom_version,
        drive.standard,
        drive.length,
        drive.data_rate,
        drive.wakeup
    );
    println!(
        "Data segments {}..={}, {} file marks",
        session.first_data_segment(),
        session.last_data_segment(),
        session.file_marks().len()
    );

    let written = write_pass(&mut session, &exercise, &mut rng)?;
    if written.is_empty() {
        bail!("no segment of {}..+{} could take data", exercise.start_segment, exercise.segments);
    }

    for _ in 0..exercise.crc_faults {
        let (segment, _) = &written[rng.gen_range(0..written.len())];
        let bad = session.bad_sectors(*segment);
        let good: Vec<u8> = (0..SECTORS_PER_SEGMENT as u8).filter(|&s| !bad.is_set(s)).collect();
        let sector = good[rng.gen_range(0..good.len())];
        log::info!("Injecting data CRC error at {}:{}", segment, sector);
        session.hardware_mut().inject_crc(*segment, sector, 1);
    }

    for (segment, data) in &written {
        let read = session
            .read_segment(*segment)
            .with_context(|| format!("reading segment {}", segment))?;
        if read.data != *data {
            bail!("segment {} read back differs from what was written", segment);
        }
    }
    println!("Read back {} segments", written.len());

    if exercise.file_marks > 0 {
        session.seek_to_bot()?;
        session.seek_to_file_mark(1)?;
        println!("First file mark ends before segment {}", session.position());
        session.seek_to_eot()?;
        println!("End of recorded data at segment {}", session.position());
    }

    if exercise.close {
        session.close().context("closing session")?;
    }

    let history = session.history();
    println!(
        "Errors: {} ({} data crc, {} id), {} blocks corrected, {} sector retries, {} segment retries, {} fast skips",
        history.total_errors(),
        history.crc_errors,
        history.id_am_errors + history.id_crc_errors,
        history.corrected,
        history.sector_retries,
        history.segment_retries,
        history.fast_skips
    );
    if history.ecc_failures > 0 {
        bail!("{} segments could not be corrected", history.ecc_failures);
    }
    Ok(())
}

/// Fill the configured range with random data and record the file marks after it.
/// Returns what went into each segment that took data.
fn write_pass(
    session: &mut TapeSession<SimulatedFdc>,
    exercise: &Exercise,
    rng: &mut StdRng,
) -> anyhow::Result<Vec<(u32, Vec<u8>)>> {
    let first = exercise.start_segment.max(session.first_data_segment());
    let end = first
        .saturating_add(exercise.segments)
        .min(session.last_data_segment() + 1);

    let mut written = Vec::new();
    for segment in first..end {
        let capacity = session.segment_capacity(segment);
        if capacity == 0 {
            continue;
        }
        let mut data = vec![0u8; capacity];
        rng.fill(&mut data[..]);
        session
            .write_segment(segment, &data, false)
            .with_context(|| format!("writing segment {}", segment))?;
        written.push((segment, data));
    }
    session.flush_buffers()?;
    println!("Wrote segments {}..{}", first, end);

    if exercise.file_marks > 0 {
        session.set_position(end)?;
        session.write_file_marks(exercise.file_marks)?;
    }
    Ok(written)
}
