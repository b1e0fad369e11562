/// Runtime tunables recognized from the environment.
///
/// Each field maps to one environment variable; unset or unparsable values
/// fall back to the documented default so a bare deployment runs with the
/// shipped behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuning {
    /// `FRAME_BUFFER_MAXLEN`: per-camera frame bus cap.
    pub frame_buffer_maxlen: usize,
    /// `BATCH_SIZE`: worker micro-batch size.
    pub batch_size: usize,
    /// `BATCH_TIMEOUT_MS`: worker micro-batch timeout.
    pub batch_timeout_ms: u64,
    /// `COSINE_THRESHOLD`: minimum cosine for an ANN candidate to survive.
    pub cosine_threshold: f32,
    /// `HISTORY_THRESHOLD`: minimum average score for history confirmation.
    pub history_threshold: f32,
    /// `TEMPORAL_GATE_WINDOW_S`: max session time and registry TTL. One
    /// parameter serves both purposes.
    pub temporal_gate_window_s: f64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            frame_buffer_maxlen: 100,
            batch_size: 4,
            batch_timeout_ms: 20,
            cosine_threshold: 0.72,
            history_threshold: 0.74,
            temporal_gate_window_s: 3600.0,
        }
    }
}

impl Tuning {
    pub fn from_env() -> Self {
        let d = Tuning::default();
        Self {
            frame_buffer_maxlen: env_or("FRAME_BUFFER_MAXLEN", d.frame_buffer_maxlen),
            batch_size: env_or("BATCH_SIZE", d.batch_size),
            batch_timeout_ms: env_or("BATCH_TIMEOUT_MS", d.batch_timeout_ms),
            cosine_threshold: env_or("COSINE_THRESHOLD", d.cosine_threshold),
            history_threshold: env_or("HISTORY_THRESHOLD", d.history_threshold),
            temporal_gate_window_s: env_or("TEMPORAL_GATE_WINDOW_S", d.temporal_gate_window_s),
        }
    }
}

fn env_or<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(
                    "ignoring unparsable {name}=\"{raw}\", using default {default}"
                );
                default
            }
        },
        Err(_) => default,
    }
}
