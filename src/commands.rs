use crate::stats::{intervals, BenchReport, Summary};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use e4_protocol::{Device, DeviceConnection, E4Client, StreamId, StreamSample};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// How often waiting loops check for Ctrl+C
const POLL_INTERVAL: Duration = Duration::from_millis(100);
// Longest wait for the first frame of a benchmark repetition
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

pub fn print_devices(devices: &[Device], json: bool) -> Result<()> {
    if devices.is_empty() && !json {
        println!("No devices found");
    }
    for device in devices {
        if json {
            println!("{}", serde_json::to_string(device)?);
        } else {
            println!("{}", device);
        }
    }
    Ok(())
}

/// Install a Ctrl+C handler that raises the returned flag
pub fn stop_flag() -> Result<Arc<AtomicBool>> {
    let should_stop = Arc::new(AtomicBool::new(false));
    let should_stop_clone = should_stop.clone();
    ctrlc::set_handler(move || {
        info!("🛑 Received Ctrl+C, shutting down...");
        should_stop_clone.store(true, Ordering::Relaxed);
    })
    .context("Failed to install Ctrl+C handler")?;
    Ok(should_stop)
}

/// Explicit device or the first one the server reports
fn resolve_device(client: &E4Client, device: Option<String>) -> Result<String> {
    if let Some(device) = device {
        return Ok(device);
    }
    let devices = client
        .list_connected_devices()
        .context("Failed to list connected devices")?;
    match devices.into_iter().next() {
        Some(device) => {
            info!("Using first connected device {}", device);
            Ok(device.uid)
        }
        None => bail!("No devices are connected to the streaming server"),
    }
}

fn format_sample(sample: &StreamSample, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string(sample)?);
    }

    let seconds = sample.timestamp.trunc() as i64;
    let nanos = (sample.timestamp.fract() * 1e9) as u32;
    let time = match DateTime::<Utc>::from_timestamp(seconds, nanos) {
        Some(time) => time.format("%H:%M:%S%.3f").to_string(),
        None => format!("{:.3}", sample.timestamp),
    };

    let values: Vec<String> = sample.values.iter().map(|v| v.to_string()).collect();
    Ok(format!("{:<7} {} {}", sample.stream.to_string(), time, values.join(" ")))
}

fn print_samples(receiver: Receiver<StreamSample>, json: bool, should_stop: &AtomicBool) -> u64 {
    let mut printed = 0;
    while !should_stop.load(Ordering::Relaxed) {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(sample) => match format_sample(&sample, json) {
                Ok(line) => {
                    println!("{}", line);
                    printed += 1;
                }
                Err(e) => warn!("⚠️ Could not format sample: {}", e),
            },
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    printed
}

/// Print samples of `streams` until `duration` passes or Ctrl+C
pub fn stream(
    client: &E4Client,
    device: Option<String>,
    streams: &[StreamId],
    duration: Option<Duration>,
    json: bool,
    should_stop: Arc<AtomicBool>,
) -> Result<()> {
    let device = resolve_device(client, device)?;
    let mut connection = client
        .connect_to_device(&device)
        .with_context(|| format!("Failed to connect to device {}", device))?;

    let mut receivers = Vec::new();
    for &stream in streams {
        let receiver = connection
            .subscribe_to_stream(stream)
            .with_context(|| format!("Failed to subscribe to {}", stream))?;
        receivers.push((stream, receiver));
    }

    let started = Instant::now();
    let printed = thread::scope(|scope| {
        let consumers: Vec<_> = receivers
            .into_iter()
            .map(|(stream, receiver)| {
                let should_stop = &should_stop;
                let consumer = scope.spawn(move || print_samples(receiver, json, should_stop));
                (stream, consumer)
            })
            .collect();

        while !should_stop.load(Ordering::Relaxed) && client.is_connected() {
            if duration.is_some_and(|limit| started.elapsed() >= limit) {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        should_stop.store(true, Ordering::Relaxed);

        consumers
            .into_iter()
            .map(|(stream, consumer)| (stream, consumer.join().unwrap_or_default()))
            .collect::<Vec<_>>()
    });

    for (stream, count) in printed {
        info!(
            "{}: {} samples printed, {} dropped",
            stream,
            count,
            client.dropped_samples(stream)
        );
    }

    connection
        .disconnect()
        .with_context(|| format!("Failed to tear down device {}", device))
}

fn bench_repetition(
    connection: &mut DeviceConnection<'_>,
    stream: StreamId,
    window: Duration,
) -> Result<(f64, Vec<f64>)> {
    let receiver = connection.subscribe_to_stream(stream)?;

    let first = match receiver.recv_timeout(FIRST_FRAME_TIMEOUT) {
        Ok(sample) => sample,
        Err(_) => bail!("No {} frame within {:?}", stream, FIRST_FRAME_TIMEOUT),
    };

    let started = Instant::now();
    let mut timestamps = vec![first.timestamp];
    while let Some(remaining) = window.checked_sub(started.elapsed()) {
        match receiver.recv_timeout(remaining) {
            Ok(sample) => timestamps.push(sample.timestamp),
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => bail!("Connection closed during benchmark"),
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    connection.unsubscribe_from_stream(stream)?;

    let frames = timestamps.len() - 1;
    Ok((frames as f64 / elapsed, intervals(&timestamps)))
}

/// Measure the frame rate and timestamp spacing of one stream
pub fn bench(
    client: &E4Client,
    device: Option<String>,
    stream: StreamId,
    window: Duration,
    repetitions: u32,
    should_stop: Arc<AtomicBool>,
) -> Result<BenchReport> {
    let device = resolve_device(client, device)?;
    let mut connection = client
        .connect_to_device(&device)
        .with_context(|| format!("Failed to connect to device {}", device))?;

    let mut rates = Vec::new();
    let mut spacing = Vec::new();
    for repetition in 1..=repetitions {
        if should_stop.load(Ordering::Relaxed) {
            break;
        }
        info!("Running repetition {}/{}", repetition, repetitions);
        let (rate, mut repetition_spacing) = bench_repetition(&mut connection, stream, window)
            .with_context(|| format!("Repetition {} failed", repetition))?;
        rates.push(rate);
        spacing.append(&mut repetition_spacing);
    }

    connection
        .disconnect()
        .with_context(|| format!("Failed to tear down device {}", device))?;

    Ok(BenchReport {
        stream: stream.to_string(),
        nominal_rate_hz: stream.nominal_rate_hz(),
        repetitions: rates.len(),
        rate_hz: Summary::from_values(&rates),
        interval_s: Summary::from_values(&spacing),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sample_text() {
        let sample = StreamSample {
            stream: StreamId::Acc,
            timestamp: 1577836800.125,
            values: vec![51.0, -2.0, -10.0],
        };
        assert_eq!(
            format_sample(&sample, false).unwrap(),
            "acc     00:00:00.125 51 -2 -10"
        );
    }

    #[test]
    fn test_format_sample_json() {
        let sample = StreamSample {
            stream: StreamId::Tag,
            timestamp: 12.5,
            values: vec![],
        };
        assert_eq!(
            format_sample(&sample, true).unwrap(),
            r#"{"stream":"tag","timestamp":12.5,"values":[]}"#
        );
    }
}
