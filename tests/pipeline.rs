use std::path::{Path, PathBuf};

use tunetag::{analyze_audio_features, AnalysisConfig, Analyzer, DecodeError, Method, StereoImage};

const SR: u32 = 22050;

fn write_wav(path: &Path, channels: &[Vec<f32>]) {
    let spec = hound::WavSpec {
        channels: channels.len() as u16,
        sample_rate: SR,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..channels[0].len() {
        for channel in channels {
            writer
                .write_sample((channel[i].clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .unwrap();
        }
    }
    writer.finalize().unwrap();
}

fn click_track(bpm: f32, secs: f32) -> Vec<f32> {
    let n = (secs * SR as f32) as usize;
    let mut out = vec![0.0f32; n];
    let click_len = (0.01 * SR as f32) as usize;
    let mut beat = 0;
    loop {
        let start = (beat as f32 * 60.0 / bpm * SR as f32).round() as usize;
        if start >= n {
            break;
        }
        for i in 0..click_len.min(n - start) {
            let t = i as f32 / SR as f32;
            out[start + i] = 0.8 * (2.0 * std::f32::consts::PI * 1000.0 * t).sin() * (-t / 0.003).exp();
        }
        beat += 1;
    }
    out
}

fn sine(freq: f32, secs: f32) -> Vec<f32> {
    let n = (secs * SR as f32) as usize;
    (0..n)
        .map(|i| 0.4 * (2.0 * std::f32::consts::PI * freq * i as f32 / SR as f32).sin())
        .collect()
}

fn fixture(dir: &tempfile::TempDir, name: &str, channels: &[Vec<f32>]) -> PathBuf {
    let path = dir.path().join(name);
    write_wav(&path, channels);
    path
}

fn native_only() -> Analyzer {
    Analyzer::new(AnalysisConfig {
        advanced: false,
        ..Default::default()
    })
}

#[test]
fn stereo_click_track_three_minutes() {
    let dir = tempfile::tempdir().unwrap();
    let clicks = click_track(128.0, 180.0);
    let path = fixture(&dir, "clicks.wav", &[clicks.clone(), clicks]);

    let native = native_only().analyze_file(&path).unwrap();
    assert_eq!(native.method, Method::Native);
    assert!((native.bpm - 128.0).abs() <= 1.0, "worker bpm {}", native.bpm);
    assert!(native.stereo.correlation > 0.99);
    assert_eq!(native.duration, 180.0);
    assert!(native.key.is_none());

    let advanced = Analyzer::default().analyze_file(&path).unwrap();
    assert_eq!(advanced.method, Method::Advanced);
    assert!((advanced.bpm - 128.0).abs() <= 1.0, "extractor bpm {}", advanced.bpm);
    assert!(advanced.key.is_some() && advanced.mode.is_some());
    assert_eq!(advanced.duration, 180.0);
    assert_eq!(advanced.loudness_db, native.loudness_db);
}

#[test]
fn mono_file_reads_as_centered() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "mono.wav", &[sine(440.0, 10.0)]);

    let features = analyze_audio_features(&path).unwrap();
    assert_eq!(features.stereo, StereoImage::MONO);
    assert_eq!(features.duration, 10.0);
    assert!(features.loudness_db < 0.0 && features.loudness_db > -20.0);
}

#[test]
fn text_renamed_to_wav_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.wav");
    std::fs::write(&path, "these are liner notes, not audio\n".repeat(64)).unwrap();

    let err = native_only().analyze_file(&path).unwrap_err();
    assert!(matches!(err, DecodeError::Unsupported(_)), "got {:?}", err);
    assert!(err.to_string().starts_with("unsupported format"));
}

#[test]
fn missing_file_is_unreadable() {
    let dir = tempfile::tempdir().unwrap();
    let err = native_only().analyze_file(&dir.path().join("gone.wav")).unwrap_err();
    assert!(err.is_unreadable());
    assert!(err.to_string().starts_with("file unreadable"));
}

#[test]
fn short_file_falls_back_to_native() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "short.wav", &[sine(220.0, 2.0), sine(220.0, 2.0)]);

    let features = Analyzer::default().analyze_file(&path).unwrap();
    assert_eq!(features.method, Method::Native);
    assert!(features.key.is_none());
    assert_eq!(features.duration, 2.0);
}

#[test]
fn same_bytes_same_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(&dir, "tone.wav", &[sine(330.0, 6.0), sine(660.0, 6.0)]);
    let bytes = std::fs::read(&path).unwrap();

    let analyzer = native_only();
    let from_file = analyzer.analyze_file(&path).unwrap();
    let from_bytes = analyzer.analyze_bytes(bytes, Some("wav")).unwrap();

    assert_eq!(from_file.duration, from_bytes.duration);
    assert_eq!(from_file.bpm, from_bytes.bpm);
    assert!((from_file.loudness_db - from_bytes.loudness_db).abs() < 0.01);
    assert_eq!(from_file.balance, from_bytes.balance);
}
