use super::*;

use std::{
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| map.get(name).cloned()
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::default();
    settings.validate().expect("defaults validate");
    assert_eq!(settings.upload_retries, 3);
    assert_eq!(settings.max_recording_duration(), Duration::from_secs(300));
    assert_eq!(
        settings.realtime_url().expect("derived"),
        "ws://127.0.0.1:54321"
    );
}

#[test]
fn realtime_url_follows_https_backend() {
    let settings = Settings {
        backend_url: "https://forum.example.com/".into(),
        ..Settings::default()
    };
    assert_eq!(
        settings.realtime_url().expect("derived"),
        "wss://forum.example.com"
    );
}

#[test]
fn file_values_override_defaults() {
    let mut settings = Settings::default();
    settings
        .apply_file(
            r#"
backend_url = "https://forum.example.com"
upload_retries = 5
voice_buckets = ["voice", "fallback"]
notify_follows = true
unknown_key = "ignored"
"#,
        )
        .expect("apply file");

    assert_eq!(settings.backend_url, "https://forum.example.com");
    assert_eq!(settings.upload_retries, 5);
    assert_eq!(settings.voice_buckets, vec!["voice", "fallback"]);
    assert!(settings.notify_follows);
}

#[test]
fn app_env_wins_over_forum_env() {
    let mut settings = Settings::default();
    settings
        .apply_env(lookup_from(&[
            ("FORUM_UPLOAD_RETRIES", "2"),
            ("APP__UPLOAD_RETRIES", "7"),
            ("FORUM_MEDIA_BUCKETS", "a, b ,,c"),
            ("FORUM_ACCESS_TOKEN", ""),
        ]))
        .expect("apply env");

    assert_eq!(settings.upload_retries, 7);
    assert_eq!(settings.media_buckets, vec!["a", "b", "c"]);
    assert_eq!(settings.access_token, None);
}

#[test]
fn rejects_unparseable_numbers() {
    let mut settings = Settings::default();
    let err = settings
        .apply_env(lookup_from(&[("FORUM_MAX_UPLOAD_BYTES", "lots")]))
        .expect_err("should reject");
    assert!(err.to_string().contains("max_upload_bytes"));
}

#[test]
fn validate_rejects_bad_urls_and_empty_chains() {
    let bad_scheme = Settings {
        backend_url: "ftp://forum.example.com".into(),
        ..Settings::default()
    };
    assert!(bad_scheme.validate().is_err());

    let bad_realtime = Settings {
        realtime_url: Some("http://forum.example.com".into()),
        ..Settings::default()
    };
    assert!(bad_realtime.validate().is_err());

    let no_buckets = Settings {
        voice_buckets: Vec::new(),
        ..Settings::default()
    };
    assert!(no_buckets.validate().is_err());

    let no_retries = Settings {
        upload_retries: 0,
        ..Settings::default()
    };
    assert!(no_retries.validate().is_err());
}

#[test]
fn voice_uses_its_own_bucket_chain() {
    let settings = Settings::default();
    let voice: Vec<String> = settings
        .bucket_candidates(MediaKind::Voice)
        .into_iter()
        .map(|candidate| candidate.bucket)
        .collect();
    let image: Vec<String> = settings
        .bucket_candidates(MediaKind::Image)
        .into_iter()
        .map(|candidate| candidate.bucket)
        .collect();
    assert_eq!(voice, vec!["voice-messages", "chat-media"]);
    assert_eq!(image, vec!["chat-media", "public-media"]);
}

#[test]
fn policies_reflect_settings() {
    let settings = Settings {
        upload_retries: 4,
        upload_retry_delay_ms: 250,
        reconnect_initial_delay_ms: 100,
        reconnect_max_attempts: 3,
        ..Settings::default()
    };
    let retry = settings.retry_policy();
    assert_eq!(retry.attempts_per_candidate, 4);
    assert_eq!(retry.delay, Duration::from_millis(250));

    let reconnect = settings.reconnect_policy();
    assert_eq!(reconnect.initial_delay, Duration::from_millis(100));
    assert_eq!(reconnect.max_attempts, 3);
}

#[test]
fn load_settings_from_reads_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("forum_client_settings_{suffix}.toml"));
    fs::write(&path, "api_key = \"anon-key\"\nmax_recording_seconds = 60\n").expect("write");

    let settings = load_settings_from(&path).expect("load");
    assert_eq!(settings.api_key, "anon-key");
    assert_eq!(settings.max_recording_duration(), Duration::from_secs(60));

    fs::remove_file(path).expect("cleanup");
}
