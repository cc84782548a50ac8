//! Pattern event engine
//!
//! Per-session registry of match rules run against a rolling window of the
//! processed output. Matching happens on every processed chunk; debouncing
//! suppresses duplicates caused by overlapping chunk boundaries. Custom
//! predicates exist only server-side and are referenced by name — the wire
//! protocol never carries functions.

use crate::error::{Result, ShelltenderError};
use chrono::Utc;
use regex::RegexBuilder;
use shelltender_types::{PatternConfig, PatternKind, TerminalEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Conservative scanning window when no pattern asks for more context.
const DEFAULT_WINDOW_BYTES: usize = 4096;
/// Rough per-line byte estimate used to size windows from `contextLines`.
const LINE_ESTIMATE_BYTES: usize = 256;
/// Overlap kept in front of each new chunk so matches spanning a chunk
/// boundary are still seen; debounce removes the resulting duplicates.
const SCAN_OVERLAP_BYTES: usize = 512;

/// Result of a custom predicate run against the scan window.
#[derive(Debug, Clone)]
pub struct PatternHit {
    pub matched: String,
    pub groups: Option<HashMap<String, String>>,
}

pub type CustomPredicate = dyn Fn(&str) -> Option<PatternHit> + Send + Sync;

#[derive(Clone)]
enum Matcher {
    Literal(String),
    Regex(regex::Regex),
    Custom(Arc<CustomPredicate>),
}

struct RegisteredPattern {
    config: PatternConfig,
    matcher: Matcher,
    last_fire: Option<(String, Instant)>,
}

#[derive(Default)]
struct SessionPatterns {
    window: Vec<u8>,
    patterns: HashMap<String, RegisteredPattern>,
}

impl SessionPatterns {
    fn window_cap(&self) -> usize {
        self.patterns
            .values()
            .map(|p| {
                p.config
                    .options
                    .context_lines
                    .map(|lines| lines as usize * LINE_ESTIMATE_BYTES)
                    .unwrap_or(0)
            })
            .max()
            .unwrap_or(0)
            .max(DEFAULT_WINDOW_BYTES)
    }
}

#[derive(Default)]
struct EngineState {
    sessions: HashMap<String, SessionPatterns>,
    /// pattern id -> owning session id
    owners: HashMap<String, String>,
}

/// See the module docs.
pub struct PatternEngine {
    state: Mutex<EngineState>,
    custom: RwLock<HashMap<String, Arc<CustomPredicate>>>,
}

impl Default for PatternEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            custom: RwLock::new(HashMap::new()),
        }
    }

    /// Make a named predicate available to `custom` pattern configs.
    pub fn register_custom_predicate(
        &self,
        name: impl Into<String>,
        predicate: impl Fn(&str) -> Option<PatternHit> + Send + Sync + 'static,
    ) {
        self.custom
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(predicate));
    }

    /// Register a pattern against a session. Re-registering an identical
    /// config returns the existing id. Bad regexes fail here, not at scan
    /// time.
    pub fn register(&self, session_id: &str, config: PatternConfig) -> Result<String> {
        let matcher = self.compile(&config)?;
        let mut state = self.state.lock().unwrap();
        let session = state.sessions.entry(session_id.to_string()).or_default();

        if let Some((id, _)) = session.patterns.iter().find(|(_, p)| {
            p.config.name == config.name
                && p.config.kind == config.kind
                && p.config.pattern == config.pattern
        }) {
            return Ok(id.clone());
        }

        let pattern_id = Uuid::new_v4().to_string();
        session.patterns.insert(
            pattern_id.clone(),
            RegisteredPattern {
                config,
                matcher,
                last_fire: None,
            },
        );
        state
            .owners
            .insert(pattern_id.clone(), session_id.to_string());
        Ok(pattern_id)
    }

    /// Remove a pattern. Unknown ids are a no-op (idempotent).
    pub fn unregister(&self, pattern_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(session_id) = state.owners.remove(pattern_id) else {
            return false;
        };
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.patterns.remove(pattern_id);
            if session.patterns.is_empty() && session.window.is_empty() {
                state.sessions.remove(&session_id);
            }
        }
        true
    }

    pub fn session_of(&self, pattern_id: &str) -> Option<String> {
        self.state.lock().unwrap().owners.get(pattern_id).cloned()
    }

    /// Registered configs for a session, for persistence.
    pub fn patterns_for(&self, session_id: &str) -> Vec<PatternConfig> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .map(|s| s.patterns.values().map(|p| p.config.clone()).collect())
            .unwrap_or_default()
    }

    /// Drop all state for a session (kill path).
    pub fn clear_session(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.remove(session_id) {
            for id in session.patterns.keys() {
                state.owners.remove(id);
            }
        }
    }

    /// Run every registered matcher for the session against the rolling
    /// window extended with `chunk`. Returns `(pattern_id, event)` pairs;
    /// the caller dispatches them to the owning client.
    pub fn scan(&self, session_id: &str, chunk: &[u8]) -> Vec<(String, TerminalEvent)> {
        if chunk.is_empty() {
            return Vec::new();
        }

        // Phase 1: extend the window and snapshot matchers; no user code
        // runs while the lock is held.
        let (text, snapshot) = {
            let mut state = self.state.lock().unwrap();
            let Some(session) = state.sessions.get_mut(session_id) else {
                return Vec::new();
            };
            if session.patterns.is_empty() {
                return Vec::new();
            }

            session.window.extend_from_slice(chunk);
            let cap = session.window_cap();
            if session.window.len() > cap {
                let excess = session.window.len() - cap;
                session.window.drain(..excess);
            }

            let scan_start = session
                .window
                .len()
                .saturating_sub(chunk.len() + SCAN_OVERLAP_BYTES);
            let text = String::from_utf8_lossy(&session.window[scan_start..]).into_owned();
            let snapshot: Vec<(String, PatternConfig, Matcher)> = session
                .patterns
                .iter()
                .map(|(id, p)| (id.clone(), p.config.clone(), p.matcher.clone()))
                .collect();
            (text, snapshot)
        };

        // Only matches that end inside the newly appended bytes fire; the
        // overlap region exists so a match may *start* in older data, but a
        // match entirely inside old data was already reported.
        let chunk_text_len = String::from_utf8_lossy(chunk).len();
        let fresh_threshold = text.len().saturating_sub(chunk_text_len);

        // Phase 2: run matchers without the lock (custom predicates are
        // user callbacks).
        let mut hits: Vec<(String, PatternConfig, PatternHit)> = Vec::new();
        for (pattern_id, config, matcher) in snapshot {
            match matcher {
                Matcher::Literal(literal) => {
                    for (position, matched) in text.match_indices(&literal) {
                        if position + matched.len() <= fresh_threshold {
                            continue;
                        }
                        hits.push((
                            pattern_id.clone(),
                            config.clone(),
                            PatternHit {
                                matched: matched.to_string(),
                                groups: None,
                            },
                        ));
                    }
                }
                Matcher::Regex(regex) => {
                    for captures in regex.captures_iter(&text) {
                        let Some(whole) = captures.get(0) else { continue };
                        if whole.end() <= fresh_threshold {
                            continue;
                        }
                        let matched = whole.as_str().to_string();
                        let mut groups = HashMap::new();
                        for (i, group) in captures.iter().enumerate().skip(1) {
                            if let Some(group) = group {
                                groups.insert(i.to_string(), group.as_str().to_string());
                            }
                        }
                        for name in regex.capture_names().flatten() {
                            if let Some(group) = captures.name(name) {
                                groups.insert(name.to_string(), group.as_str().to_string());
                            }
                        }
                        hits.push((
                            pattern_id.clone(),
                            config.clone(),
                            PatternHit {
                                matched,
                                groups: (!groups.is_empty()).then_some(groups),
                            },
                        ));
                    }
                }
                Matcher::Custom(predicate) => {
                    if let Some(hit) = predicate(&text) {
                        hits.push((pattern_id.clone(), config.clone(), hit));
                    }
                }
            }
        }

        // Phase 3: debounce and emit.
        let mut events = Vec::new();
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let Some(session) = state.sessions.get_mut(session_id) else {
            return Vec::new();
        };

        for (pattern_id, config, hit) in hits {
            let Some(pattern) = session.patterns.get_mut(&pattern_id) else {
                continue;
            };
            let debounce = Duration::from_millis(config.options.debounce);
            if !debounce.is_zero() {
                if let Some((last_match, at)) = &pattern.last_fire {
                    if *last_match == hit.matched && now.duration_since(*at) < debounce {
                        continue;
                    }
                }
            }
            pattern.last_fire = Some((hit.matched.clone(), now));

            let (context_before, context_after) = config
                .options
                .context_lines
                .map(|lines| context_lines_around(&text, &hit.matched, lines as usize))
                .unwrap_or((None, None));

            events.push((
                pattern_id,
                TerminalEvent::PatternMatch {
                    session_id: session_id.to_string(),
                    pattern_name: config.name.clone(),
                    r#match: hit.matched,
                    groups: hit.groups,
                    context_before,
                    context_after,
                    timestamp: Utc::now(),
                },
            ));
        }
        events
    }

    fn compile(&self, config: &PatternConfig) -> Result<Matcher> {
        match config.kind {
            PatternKind::String => Ok(Matcher::Literal(config.pattern.clone())),
            PatternKind::Regex => RegexBuilder::new(&config.pattern)
                .multi_line(config.options.multiline)
                .build()
                .map(Matcher::Regex)
                .map_err(|e| ShelltenderError::PatternCompile(e.to_string())),
            PatternKind::Custom => self
                .custom
                .read()
                .unwrap()
                .get(&config.pattern)
                .cloned()
                .map(Matcher::Custom)
                .ok_or_else(|| {
                    ShelltenderError::PatternCompile(format!(
                        "unknown custom predicate: {}",
                        config.pattern
                    ))
                }),
        }
    }
}

fn context_lines_around(
    text: &str,
    matched: &str,
    count: usize,
) -> (Option<Vec<String>>, Option<Vec<String>>) {
    let Some(position) = text.rfind(matched) else {
        return (None, None);
    };
    let lines: Vec<&str> = text.lines().collect();
    let mut offset = 0usize;
    let mut match_line = 0usize;
    for (i, line) in lines.iter().enumerate() {
        let end = offset + line.len();
        if position <= end {
            match_line = i;
            break;
        }
        offset = end + 1;
    }

    let before: Vec<String> = lines[match_line.saturating_sub(count)..match_line]
        .iter()
        .map(|l| l.to_string())
        .collect();
    let after: Vec<String> = lines
        .iter()
        .skip(match_line + 1)
        .take(count)
        .map(|l| l.to_string())
        .collect();
    (
        (!before.is_empty()).then_some(before),
        (!after.is_empty()).then_some(after),
    )
}
