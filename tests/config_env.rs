// tests/config_env.rs
// These tests mutate process env, so they run under `serial_test`.

use std::env;
use std::time::Duration;

use serial_test::serial;

use scam_risk_engine::config::ENV_CONFIG_PATH;
use scam_risk_engine::{
    gate_from_env, DetectionEngine, EngineConfig, ModelState, ScanInput, ScoringMode,
};

/// Small RAII helper to snapshot & restore env vars in each test.
struct EnvSnapshot {
    saved: Vec<(String, Option<String>)>,
}
impl EnvSnapshot {
    /// Provide a list of (KEY, Some(VALUE)) to set, or (KEY, None) to remove.
    fn set(pairs: &[(&str, Option<&str>)]) -> Self {
        let mut saved = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            let key = k.to_string();
            saved.push((key.clone(), env::var(k).ok()));
            match v {
                Some(val) => env::set_var(&key, val),
                None => env::remove_var(&key),
            }
        }
        Self { saved }
    }
}
impl Drop for EnvSnapshot {
    fn drop(&mut self) {
        for (k, maybe_v) in self.saved.drain(..) {
            match maybe_v {
                Some(v) => env::set_var(&k, v),
                None => env::remove_var(&k),
            }
        }
    }
}

const CLEAR: &[&str] = &[
    "SCAM_CLASSIFIER",
    "SCAM_CLASSIFIER_ENDPOINT",
    "SCAM_ML_WEIGHT",
    "SCAM_BATCH_CAP",
    "SCAM_RISK_THRESHOLDS",
    "SCAM_WEIGHTS",
    "SCAM_ACQUIRE_WAIT_MS",
    "SCAM_API_KEYS",
    "SCAM_API_DAILY_LIMIT",
];

fn snapshot(extra: &[(&str, Option<&str>)]) -> EnvSnapshot {
    let mut pairs: Vec<(&str, Option<&str>)> = CLEAR.iter().map(|k| (*k, None)).collect();
    pairs.extend_from_slice(extra);
    EnvSnapshot::set(&pairs)
}

#[test]
#[serial]
fn file_then_env_overrides() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("engine.toml");
    std::fs::write(
        &path,
        r#"
        [batch]
        max_items = 20

        [scoring]
        ml_weight = 0.6

        [classifier]
        provider = "http"
        endpoint = "http://127.0.0.1:9/never"
        "#,
    )
    .unwrap();

    let path_str = path.to_str().unwrap();
    let _env = snapshot(&[
        (ENV_CONFIG_PATH, Some(path_str)),
        ("SCAM_BATCH_CAP", Some("25")),
        ("SCAM_CLASSIFIER", Some("mock")),
    ]);

    let cfg = EngineConfig::load().expect("load");
    assert_eq!(cfg.batch.max_items, 25, "env wins over file");
    assert_eq!(cfg.scoring.ml_weight, 0.6, "file wins over defaults");
    assert_eq!(cfg.classifier.provider, "mock");
    assert_eq!(cfg.classifier.endpoint.as_deref(), Some("http://127.0.0.1:9/never"));
}

#[test]
#[serial]
fn broken_file_is_an_error_with_context() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("engine.toml");
    std::fs::write(&path, "[batch\nmax_items = ").unwrap();

    let _env = snapshot(&[(ENV_CONFIG_PATH, Some(path.to_str().unwrap()))]);
    let err = EngineConfig::load().expect_err("must fail");
    assert!(format!("{err:#}").contains("parsing engine config"));
}

#[test]
#[serial]
fn gate_follows_api_key_env() {
    {
        let _env = snapshot(&[]);
        assert!(gate_from_env().check(None).is_permitted());
    }
    {
        let _env = snapshot(&[("SCAM_API_KEYS", Some("alpha, beta"))]);
        let gate = gate_from_env();
        assert!(gate.check(Some("beta")).is_permitted());
        assert!(!gate.check(Some("gamma")).is_permitted());
        assert!(!gate.check(None).is_permitted());
    }
}

#[tokio::test]
#[serial]
async fn mock_provider_from_env_serves_ml_scores() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("absent.toml");
    let _env = snapshot(&[
        (ENV_CONFIG_PATH, Some(missing.to_str().unwrap())),
        ("SCAM_CLASSIFIER", Some("mock")),
    ]);

    let cfg = EngineConfig::load().expect("load");
    let engine = DetectionEngine::from_config(&cfg);
    assert_eq!(engine.warm_up(Duration::from_secs(2)).await, ModelState::Ready);

    let r = engine
        .score_one(ScanInput::new("Please confirm your login details"))
        .await
        .unwrap();
    assert_eq!(r.mode, ScoringMode::MlEnsemble);
    assert_eq!(r.ml_probability, Some(0.5));
}
