/// Lifetime of a rule learned over UDP, against the 30 s client renewal.
pub const ROUTE_LIFETIME: u64 = 180;

/// Expiration sentinel: was permanent, now deprecated. Pruned like any other
/// past expiration, but distinguishable from a plain removal in the logs.
pub const TOMBSTONE: u64 = 1;

/// The table stays small by construction; anything past this is a
/// misbehaving client and gets dropped.
pub const MAX_RULES: usize = 128;

/// One redirection rule. `expires` is 0 for a permanent rule (loaded from
/// the static configuration), [`TOMBSTONE`] for a deprecated one, and a
/// wall-clock epoch second otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub path: String,
    /// `host:port`, or a bare port to be completed with the portal host.
    pub target: String,
    pub service: Option<String>,
    pub hide: bool,
    pub pid: Option<u32>,
    pub start: u64,
    pub expires: u64,
}

impl Rule {
    pub fn permanent(&self) -> bool {
        self.expires == 0
    }

    pub fn active(&self, now: u64) -> bool {
        self.expires == 0 || self.expires >= now
    }
}

/// Outcome of an upsert, carrying what the caller needs to log it.
#[derive(Debug, Clone)]
pub enum RuleChange {
    Added(Rule),
    Refreshed,
    /// Same path came back with another target or PID: the backend restarted.
    Restarted { rule: Rule, previous: String },
    /// A live declaration does not displace a permanent rule.
    Shadowed,
    Full(Rule),
}

/// The authoritative set of redirection rules. Paths are unique; lookups are
/// linear, which beats any index at this size.
#[derive(Debug, Default)]
pub struct RuleTable(Vec<Rule>);

impl RuleTable {
    /// Insert or refresh the rule carrying `rule.path`.
    ///
    /// A renewal updates target, service, hide, PID and expiration in place
    /// and keeps the original start time unless the target or PID changed.
    /// A live rule never overwrites a permanent one.
    pub fn upsert(&mut self, rule: Rule) -> RuleChange {
        if let Some(existing) = self.0.iter_mut().find(|entry| entry.path == rule.path) {
            if existing.permanent() && rule.expires > 0 {
                return RuleChange::Shadowed;
            }

            let restarted = existing.target != rule.target || existing.pid != rule.pid;
            let previous = std::mem::replace(&mut existing.target, rule.target);

            existing.service = rule.service;
            existing.hide = rule.hide;
            existing.pid = rule.pid;
            existing.expires = rule.expires;

            return if restarted {
                existing.start = rule.start;
                RuleChange::Restarted {
                    rule: existing.clone(),
                    previous,
                }
            } else {
                RuleChange::Refreshed
            };
        }

        if self.0.len() >= MAX_RULES {
            return RuleChange::Full(rule);
        }

        self.0.push(rule.clone());
        RuleChange::Added(rule)
    }

    /// Longest-prefix match: the matched prefix must end at a path boundary
    /// (end of the request path or a `/`). Expired rules are skipped.
    pub fn lookup(&self, path: &str, now: u64) -> Option<&Rule> {
        self.0
            .iter()
            .filter(|rule| rule.active(now))
            .filter(|rule| {
                path.starts_with(&rule.path)
                    && (path.len() == rule.path.len() || path.as_bytes()[rule.path.len()] == b'/')
            })
            .max_by_key(|rule| rule.path.len())
    }

    /// Remove every rule whose expiration has passed, tombstones included.
    pub fn prune(&mut self, now: u64) -> Vec<Rule> {
        let mut removed = Vec::new();

        self.0.retain(|rule| {
            if rule.expires > 0 && rule.expires < now {
                removed.push(rule.clone());
                false
            } else {
                true
            }
        });

        removed
    }

    /// Mark every permanent rule deprecated. Rules the new configuration
    /// re-declares become permanent again; the rest fall to the next prune.
    pub fn deprecate_permanent(&mut self) {
        for rule in &mut self.0 {
            if rule.permanent() {
                rule.expires = TOMBSTONE;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
