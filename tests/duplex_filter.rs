use intercom_duplex::audio::{
    AudioFormat, Cancellation, DuplexSettings, FrameMode, LatencyAlignedDuplexFilter,
    ProcessingChain, ProcessingOptions, RingByteBuffer,
};

/// Writes `recorded - played` and counts invocations.
#[derive(Default)]
struct Subtract {
    calls: usize,
}

impl Cancellation for Subtract {
    fn perform_cancellation(&mut self, recorded: &[i16], played: &[i16], out: &mut [i16]) {
        self.calls += 1;
        for ((o, r), p) in out.iter_mut().zip(recorded).zip(played) {
            *o = r.saturating_sub(*p);
        }
    }
}

fn settings(latency_ms: u32) -> DuplexSettings {
    let f = AudioFormat::pcm16(8000, 1, 20).unwrap();
    DuplexSettings {
        system_latency_ms: latency_ms,
        filter_length_ms: 20,
        recorded: f,
        played: f,
    }
}

fn pcm(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

#[test]
fn alignment_starts_after_queue_fills() {
    let s = settings(150);
    assert_eq!(s.queue_size(), 7);
    let mut filter = LatencyAlignedDuplexFilter::new(s, Subtract::default()).unwrap();
    let bpf = s.recorded.bytes_per_frame();
    let mut out = vec![0u8; bpf];

    let mut modes = Vec::new();
    for k in 1..=10i16 {
        let recorded = pcm(&vec![1000 + k; 160]);
        let processed = filter.process(&recorded, &mut out).unwrap().unwrap();
        assert!(!processed.more);
        modes.push(processed.mode);
        filter.register_frame_played(&pcm(&vec![k; 160])).unwrap();
    }

    assert!(modes[..7].iter().all(|m| *m == FrameMode::PassedThrough));
    assert!(modes[7..].iter().all(|m| *m == FrameMode::Cancelled));
    assert_eq!(filter.canceller().calls, 3);

    // the 10th recorded frame pairs with the 3rd played frame
    assert!(samples(&out).iter().all(|&v| v == 1010 - 3));
    let stats = filter.stats();
    assert_eq!(stats.frames_cancelled, 3);
    assert_eq!(stats.frames_passed_through, 7);
    assert_eq!(stats.queue_depth, 7);
    assert!(stats.aligned);
}

#[test]
fn without_played_audio_capture_passes_unchanged() {
    let s = settings(60);
    let mut filter = LatencyAlignedDuplexFilter::new(s, Subtract::default()).unwrap();
    let mut out = vec![0u8; s.recorded.bytes_per_frame()];

    for k in 0..20i16 {
        let recorded = pcm(&(0..160).map(|i| i * k).collect::<Vec<_>>());
        let processed = filter.process(&recorded, &mut out).unwrap().unwrap();
        assert_eq!(processed.mode, FrameMode::PassedThrough);
        assert_eq!(out, recorded);
    }
    assert_eq!(filter.canceller().calls, 0);
    assert_eq!(filter.stats().underruns, 0);
}

#[test]
fn underrun_reverts_to_pass_through_until_refilled() {
    let s = settings(40);
    let mut filter = LatencyAlignedDuplexFilter::new(s, Subtract::default()).unwrap();
    let bpf = s.recorded.bytes_per_frame();
    let recorded = pcm(&vec![500; 160]);
    let mut out = vec![0u8; bpf];

    for _ in 0..2 {
        filter.register_frame_played(&pcm(&vec![100; 160])).unwrap();
    }
    let mode = |f: &mut LatencyAlignedDuplexFilter<Subtract>, out: &mut [u8]| {
        f.process(&recorded, out).unwrap().unwrap().mode
    };
    assert_eq!(mode(&mut filter, &mut out), FrameMode::Cancelled);
    assert_eq!(mode(&mut filter, &mut out), FrameMode::Cancelled);
    assert!(samples(&out).iter().all(|&v| v == 400));

    // queue drained: the next frame passes through and the latch resets
    assert_eq!(mode(&mut filter, &mut out), FrameMode::PassedThrough);
    assert_eq!(out, recorded);
    let stats = filter.stats();
    assert_eq!(stats.underruns, 1);
    assert!(!stats.aligned);

    // one frame is not enough to realign with a queue size of two
    filter.register_frame_played(&pcm(&vec![100; 160])).unwrap();
    assert_eq!(mode(&mut filter, &mut out), FrameMode::PassedThrough);
    filter.register_frame_played(&pcm(&vec![100; 160])).unwrap();
    assert_eq!(mode(&mut filter, &mut out), FrameMode::Cancelled);
    assert_eq!(filter.stats().underruns, 1);
}

#[test]
fn played_audio_is_resampled_to_the_recorded_format() {
    let recorded = AudioFormat::pcm16(16000, 1, 20).unwrap();
    let played = AudioFormat::pcm16(8000, 2, 20).unwrap();
    let s = DuplexSettings {
        system_latency_ms: 20,
        filter_length_ms: 20,
        recorded,
        played,
    };
    let mut filter = LatencyAlignedDuplexFilter::new(s, Subtract::default()).unwrap();

    // 8 kHz stereo and 16 kHz mono carry the same number of samples per
    // frame, so the interleaved stream maps one to one
    let played_ramp: Vec<i16> = (0..160).flat_map(|k| [k, 1000 + k]).collect();
    filter.register_frame_played(&pcm(&played_ramp)).unwrap();
    let mut out = vec![0u8; recorded.bytes_per_frame()];
    let processed = filter.process(&pcm(&vec![2000; 320]), &mut out).unwrap().unwrap();
    assert_eq!(processed.mode, FrameMode::Cancelled);

    let out = samples(&out);
    assert_eq!(out.len(), 320);
    for (i, v) in out.iter().enumerate() {
        let k = (i / 2) as i16;
        let expected = if i % 2 == 0 { 2000 - k } else { 1000 - k };
        assert_eq!(*v, expected, "sample {}", i);
    }
}

#[test]
fn burst_of_recorded_audio_is_drained_frame_by_frame() {
    let s = settings(20);
    let mut filter = LatencyAlignedDuplexFilter::new(s, Subtract::default()).unwrap();
    let mut out = vec![0u8; s.recorded.bytes_per_frame()];

    let burst = pcm(&vec![7; 160 * 3 + 80]);
    let first = filter.process(&burst, &mut out).unwrap().unwrap();
    assert!(first.more);
    let second = filter.read(&mut out).unwrap().unwrap();
    assert!(second.more);
    let third = filter.read(&mut out).unwrap().unwrap();
    assert!(!third.more);
    assert!(filter.read(&mut out).unwrap().is_none());

    // the half frame left over completes with the next write
    let next = filter.process(&pcm(&vec![7; 80]), &mut out).unwrap().unwrap();
    assert!(!next.more);
    assert_eq!(filter.stats().frames_passed_through, 4);
}

#[test]
fn ring_buffer_keeps_newest_frames() {
    let frame = 320;
    let rb = RingByteBuffer::new(frame * 3);
    let mut evicted = 0;
    for k in 1..=10u8 {
        evicted += rb.write(&vec![k; frame]);
    }
    assert_eq!(evicted, frame * 7);
    assert_eq!(rb.len(), frame * 3);

    let mut out = vec![0u8; frame * 3];
    assert_eq!(rb.read(&mut out), frame * 3);
    for (i, chunk) in out.chunks(frame).enumerate() {
        assert!(chunk.iter().all(|&b| b == 8 + i as u8));
    }
    assert!(rb.is_empty());
}

/// Deterministic white noise.
struct Lcg(u32);

impl Lcg {
    fn next(&mut self) -> i16 {
        self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        ((self.0 >> 16) as i16) / 4
    }
}

fn energy(x: &[i16]) -> f64 {
    x.iter().map(|&s| (s as f64) * (s as f64)).sum()
}

#[test]
fn processing_chain_removes_aligned_echo() {
    let format = AudioFormat::pcm16(16000, 1, 20).unwrap();
    let s = DuplexSettings {
        system_latency_ms: 100,
        filter_length_ms: 20,
        recorded: format,
        played: format,
    };
    let options = ProcessingOptions {
        gain_control: false,
        noise_suppression: false,
        ..ProcessingOptions::default()
    };
    let chain = ProcessingChain::new(&s, &options).unwrap();
    let mut filter = LatencyAlignedDuplexFilter::new(s, chain).unwrap();

    let n = format.interleaved_samples_per_frame();
    let mut rng = Lcg(11);
    let played: Vec<Vec<i16>> = (0..150).map(|_| (0..n).map(|_| rng.next()).collect()).collect();

    let mut out = vec![0u8; format.bytes_per_frame()];
    let mut echo_energy = 0.0;
    let mut residual_energy = 0.0;
    for k in 0..played.len() {
        // the microphone hears the frame played five frames (100 ms) earlier
        let recorded: Vec<i16> = match k.checked_sub(s.queue_size()) {
            Some(j) => played[j].iter().map(|&v| v / 2).collect(),
            None => vec![0; n],
        };
        let processed = filter.process(&pcm(&recorded), &mut out).unwrap().unwrap();
        if k >= s.queue_size() {
            assert_eq!(processed.mode, FrameMode::Cancelled);
        }
        if k >= 130 {
            echo_energy += energy(&recorded);
            residual_energy += energy(&samples(&out));
        }
        filter.register_frame_played(&pcm(&played[k])).unwrap();
    }

    assert!(
        residual_energy < echo_energy * 0.1,
        "residual {} vs echo {}",
        residual_energy,
        echo_energy
    );
}
