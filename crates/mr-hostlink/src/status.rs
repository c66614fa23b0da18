//! Subscription poll scheduling.
//!
//! Status subscriptions are grouped by poll interval and driven by a tick
//! wheel of [`MAX_TICKS`] slots: a group with interval `n` fires on every
//! tick where `current_tick % n == 0`. Intervals are resolved from a
//! per-object-name rule table (exact name first, then regex patterns);
//! an interval of 0 blacklists the object from subscription entirely.
//! The wheel is observable through `poll_times` in the subscription info,
//! so the modulo-64 arithmetic is part of the external contract.

use regex::Regex;
use std::collections::HashMap;
use tracing::info;

/// Size of the tick wheel.
pub const MAX_TICKS: u64 = 64;
/// Default wheel period in seconds.
pub const DEFAULT_TICK_TIME: f64 = 0.25;
/// Interval assigned to object names no rule matches.
const DEFAULT_POLL_TICKS: u64 = 16;

struct PollRule {
    pattern: String,
    regex: Option<Regex>,
    ticks: u64,
}

impl PollRule {
    fn new(pattern: &str, ticks: u64) -> Self {
        // Patterns behave like a match from the start of the name, so
        // `extruder.*` covers `extruder1` while `fan` still prefix-matches
        // only names beginning with "fan".
        let regex = Regex::new(&format!("^(?:{pattern})")).ok();
        PollRule {
            pattern: pattern.to_owned(),
            regex,
            ticks,
        }
    }
}

/// One coalesced group of objects polled at a shared interval.
struct SubscriptionGroup {
    /// Object name -> requested attributes (empty = all).
    objects: HashMap<String, Vec<String>>,
    poll_ticks: u64,
}

pub struct StatusSchedule {
    tick_time: f64,
    current_tick: u64,
    rules: Vec<PollRule>,
    /// Object name -> its full attribute list, for selection expansion.
    available: HashMap<String, Vec<String>>,
    subscriptions: Vec<SubscriptionGroup>,
}

impl StatusSchedule {
    pub fn new(tick_time: f64) -> Self {
        let rules = [
            ("toolhead", 1),
            ("gcode", 1),
            ("idle_timeout", 1),
            ("pause_resume", 1),
            ("fan", 2),
            ("virtual_sdcard", 4),
            ("extruder.*", 4),
            ("heater.*", 4),
            ("temperature_fan", 4),
            // gcode_macros are blacklisted
            ("gcode_macro.*", 0),
        ]
        .into_iter()
        .map(|(pattern, ticks)| PollRule::new(pattern, ticks))
        .collect();
        StatusSchedule {
            tick_time,
            current_tick: 0,
            rules,
            available: HashMap::new(),
            subscriptions: Vec::new(),
        }
    }

    /// User tier overrides: tier `i` (1..=6) polls every `2^(i-1)` ticks.
    /// Blacklisted macro objects cannot be re-enabled this way.
    pub fn apply_tier(&mut self, names: &[String], tier: u32) {
        debug_assert!((1..=6).contains(&tier));
        let ticks = 2u64.pow(tier - 1);
        for name in names {
            if name.starts_with("gcode_macro") {
                continue;
            }
            match self.rules.iter_mut().find(|r| r.pattern == *name) {
                Some(rule) => rule.ticks = ticks,
                None => self.rules.push(PollRule::new(name, ticks)),
            }
        }
    }

    /// Replace the set of known status objects and their attributes.
    pub fn set_available_objects(&mut self, objects: HashMap<String, Vec<String>>) {
        self.available = objects;
    }

    pub fn available_objects(&self) -> &HashMap<String, Vec<String>> {
        &self.available
    }

    /// Resolve the poll interval for an object name: exact rule first,
    /// then pattern rules in table order, then the default.
    pub fn poll_ticks_for(&self, name: &str) -> u64 {
        if let Some(rule) = self.rules.iter().find(|r| r.pattern == name) {
            return rule.ticks;
        }
        for rule in &self.rules {
            if rule.regex.as_ref().is_some_and(|re| re.is_match(name)) {
                return rule.ticks;
            }
        }
        DEFAULT_POLL_TICKS
    }

    /// Add subscriptions, coalescing into the group with the same interval.
    /// Unknown and blacklisted objects are skipped.
    pub fn add_subscription(&mut self, objects: HashMap<String, Vec<String>>) {
        for (name, attrs) in objects {
            if !self.available.contains_key(&name) {
                info!(object = %name, "object not available for subscription");
                continue;
            }
            let poll_ticks = self.poll_ticks_for(&name);
            if poll_ticks == 0 {
                continue;
            }
            match self
                .subscriptions
                .iter_mut()
                .find(|group| group.poll_ticks == poll_ticks)
            {
                Some(group) => {
                    group.objects.insert(name, attrs);
                }
                None => {
                    self.subscriptions.push(SubscriptionGroup {
                        objects: HashMap::from([(name, attrs)]),
                        poll_ticks,
                    });
                }
            }
        }
    }

    /// Collect the selections due on the current tick, then advance the
    /// wheel one slot.
    pub fn advance(&mut self) -> HashMap<String, Vec<String>> {
        let mut due = HashMap::new();
        for group in &self.subscriptions {
            if self.current_tick % group.poll_ticks == 0 {
                due.extend(
                    group
                        .objects
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
            }
        }
        self.current_tick = (self.current_tick + 1) % MAX_TICKS;
        due
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    pub fn tick_time(&self) -> f64 {
        self.tick_time
    }

    /// Subscription info for `GET /printer/subscriptions`: the merged
    /// selections (empty ones expanded to the full attribute list) plus the
    /// poll period of each object in seconds.
    pub fn sub_info(&self) -> serde_json::Value {
        let mut objects = serde_json::Map::new();
        let mut poll_times = serde_json::Map::new();
        for group in &self.subscriptions {
            for (name, attrs) in &group.objects {
                let attrs = if attrs.is_empty() {
                    self.available.get(name).cloned().unwrap_or_default()
                } else {
                    attrs.clone()
                };
                objects.insert(name.clone(), serde_json::json!(attrs));
                poll_times.insert(
                    name.clone(),
                    serde_json::json!(group.poll_ticks as f64 * self.tick_time),
                );
            }
        }
        serde_json::json!({
            "objects": objects,
            "poll_times": poll_times,
        })
    }
}

impl Default for StatusSchedule {
    fn default() -> Self {
        StatusSchedule::new(DEFAULT_TICK_TIME)
    }
}
