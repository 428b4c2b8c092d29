/// Configures caching, jitter, statistics and offline replay behavior.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OrchestratorOptions {
    /// Lifetime of a cached GET response in milliseconds.
    pub cache_ttl_ms: u64,
    /// Upper bound (exclusive) of the random jitter added to each backoff.
    pub jitter_ceiling_ms: u64,
    /// Number of latency samples averaged into the stats.
    pub latency_window: usize,
    /// Pause after going online before the offline queue is flushed.
    pub replay_delay_ms: u64,
    /// Pause between consecutive replays.
    pub replay_spacing_ms: u64,
    /// Interval of scheduled flushes while requests remain queued and the
    /// host is online. `None` disables scheduled flushes.
    pub reflush_interval_ms: Option<u64>,
    /// Failed replays after which a queued request is dropped. `None` keeps
    /// re-enqueueing it indefinitely.
    pub max_replay_attempts: Option<u32>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 300_000,
            jitter_ceiling_ms: 1_000,
            latency_window: 100,
            replay_delay_ms: 1_000,
            replay_spacing_ms: 200,
            reflush_interval_ms: Some(30_000),
            max_replay_attempts: None,
        }
    }
}

impl OrchestratorOptions {
    /// Builds options from defaults overridden by environment variables.
    ///
    /// Reads, when set:
    /// - `ORCHESTRATOR_CACHE_TTL_MS`
    /// - `ORCHESTRATOR_JITTER_CEILING_MS`
    /// - `ORCHESTRATOR_REPLAY_DELAY_MS`
    /// - `ORCHESTRATOR_REPLAY_SPACING_MS`
    /// - `ORCHESTRATOR_REFLUSH_INTERVAL_MS` (`0` disables scheduled flushes)
    /// - `ORCHESTRATOR_MAX_REPLAY_ATTEMPTS`
    ///
    /// Returns an error naming the first variable that does not parse.
    ///
    /// **Not available on `wasm32` targets**: environment variables do not
    /// exist in browser runtimes.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn from_env() -> std::result::Result<Self, String> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    #[cfg_attr(target_arch = "wasm32", allow(dead_code))]
    fn from_lookup<F>(lookup: F) -> std::result::Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();
        if let Some(value) = parse_var(&lookup, "ORCHESTRATOR_CACHE_TTL_MS")? {
            options.cache_ttl_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "ORCHESTRATOR_JITTER_CEILING_MS")? {
            options.jitter_ceiling_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "ORCHESTRATOR_REPLAY_DELAY_MS")? {
            options.replay_delay_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "ORCHESTRATOR_REPLAY_SPACING_MS")? {
            options.replay_spacing_ms = value;
        }
        if let Some(value) = parse_var::<u64, _>(&lookup, "ORCHESTRATOR_REFLUSH_INTERVAL_MS")? {
            options.reflush_interval_ms = (value > 0).then_some(value);
        }
        if let Some(value) = parse_var(&lookup, "ORCHESTRATOR_MAX_REPLAY_ATTEMPTS")? {
            options.max_replay_attempts = Some(value);
        }
        Ok(options)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> std::result::Result<Option<T>, String>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{name} must be a non-negative integer, got '{raw}'")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::OrchestratorOptions;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let options = OrchestratorOptions::from_lookup(lookup(&[])).expect("defaults must load");
        assert_eq!(options, OrchestratorOptions::default());
        assert_eq!(options.cache_ttl_ms, 300_000);
        assert_eq!(options.jitter_ceiling_ms, 1_000);
    }

    #[test]
    fn variables_override_defaults() {
        let options = OrchestratorOptions::from_lookup(lookup(&[
            ("ORCHESTRATOR_CACHE_TTL_MS", "60000"),
            ("ORCHESTRATOR_REFLUSH_INTERVAL_MS", "0"),
            ("ORCHESTRATOR_MAX_REPLAY_ATTEMPTS", "3"),
        ]))
        .expect("valid variables must load");

        assert_eq!(options.cache_ttl_ms, 60_000);
        assert_eq!(options.reflush_interval_ms, None);
        assert_eq!(options.max_replay_attempts, Some(3));
    }

    #[test]
    fn invalid_value_names_the_variable() {
        let err = OrchestratorOptions::from_lookup(lookup(&[("ORCHESTRATOR_REPLAY_DELAY_MS", "soon")]))
            .expect_err("invalid value must fail");
        assert!(err.contains("ORCHESTRATOR_REPLAY_DELAY_MS"));
    }
}
