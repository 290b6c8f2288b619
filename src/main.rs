use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};

use intercom_duplex::audio::{self, AudioFormat, DuplexSession};
use intercom_duplex::config::{Config, SimulationConfig};
use intercom_duplex::simulation::{SimulatedRoom, Tone};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置，文件不存在时使用默认值
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load_or_default(&config_path)?;

    let settings = config.pipeline.to_settings()?;
    let pipeline = audio::build_pipeline(settings, &config.processing)
        .context("Failed to build duplex pipeline")?;

    let room = SimulatedRoom::new(settings.recorded, settings.played, &config.simulation)?;
    let meter = room.meter();
    let (microphone, speaker) = room.into_devices();

    // 上行：处理后的麦克风帧；下行：送往扬声器的远端音频
    let (uplink_tx, mut uplink_rx) = mpsc::channel::<Vec<u8>>(100);
    let (downlink_tx, downlink_rx) = mpsc::channel::<Vec<u8>>(100);

    let mut session = DuplexSession::start(pipeline, microphone, speaker, uplink_tx, downlink_rx)?;

    let far_end = tokio::spawn(far_end_talker(
        downlink_tx,
        settings.played,
        config.simulation.clone(),
    ));

    println!(
        "Intercom simulation started: recorded {}, played {}, latency {}ms (queue {} frames)",
        settings.recorded,
        settings.played,
        settings.system_latency_ms,
        settings.queue_size(),
    );

    let deadline = match config.simulation.duration_secs {
        0 => None,
        secs => Some(time::Instant::now() + Duration::from_secs(secs)),
    };
    let mut report = time::interval(Duration::from_secs(config.simulation.report_interval_secs.max(1)));
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    report.tick().await;

    let mut uplink_energy = 0.0f64;
    let mut uplink_samples = 0u64;

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }

            _ = sleep_until(deadline) => {
                println!("Simulation finished");
                break;
            }

            frame = uplink_rx.recv() => {
                let Some(frame) = frame else {
                    log::warn!("Uplink closed");
                    break;
                };
                for s in frame.chunks_exact(2) {
                    let v = i16::from_le_bytes([s[0], s[1]]) as f64;
                    uplink_energy += v * v;
                }
                uplink_samples += (frame.len() / 2) as u64;
            }

            _ = report.tick() => {
                let mic = meter.take();
                let stats = session.stats();
                println!(
                    "mic {:6.1} dBFS | echo {:6.1} dBFS | uplink {:6.1} dBFS | ERLE {:5.1} dB | cancelled {} passed {} underruns {} queue {}/{}",
                    dbfs(mic.capture_energy, mic.samples),
                    dbfs(mic.echo_energy, mic.samples),
                    dbfs(uplink_energy, uplink_samples),
                    erle(mic.echo_energy, mic.samples, uplink_energy, uplink_samples),
                    stats.frames_cancelled,
                    stats.frames_passed_through,
                    stats.underruns,
                    stats.queue_depth,
                    settings.queue_size(),
                );
                uplink_energy = 0.0;
                uplink_samples = 0;
            }
        }
    }

    far_end.abort();
    // dropping the task drops the downlink sender, which ends playback
    let _ = far_end.await;
    drop(uplink_rx);
    session.stop();
    log::info!("Final filter stats: {:?}", session.stats());
    Ok(())
}

/// Push a far-end tone onto the downlink in real time.
async fn far_end_talker(downlink_tx: mpsc::Sender<Vec<u8>>, format: AudioFormat, sim: SimulationConfig) {
    let mut tone = Tone::new(sim.far_end_hz, sim.far_end_amplitude, format.sample_rate());
    let mut ticker = time::interval(Duration::from_millis(format.milliseconds_per_frame() as u64));
    loop {
        ticker.tick().await;
        if downlink_tx.send(tone.frame(format)).await.is_err() {
            log::info!("Downlink closed, far-end talker exits");
            break;
        }
    }
}

async fn sleep_until(deadline: Option<time::Instant>) {
    match deadline {
        Some(t) => time::sleep_until(t).await,
        None => std::future::pending().await,
    }
}

fn dbfs(energy: f64, samples: u64) -> f64 {
    if samples == 0 || energy <= 0.0 {
        return -96.0;
    }
    let rms = (energy / samples as f64).sqrt();
    (20.0 * (rms / 32768.0).log10()).max(-96.0)
}

/// Echo-return-loss enhancement: echo power at the mic over uplink power.
fn erle(echo: f64, echo_samples: u64, uplink: f64, uplink_samples: u64) -> f64 {
    dbfs(echo, echo_samples) - dbfs(uplink, uplink_samples)
}
