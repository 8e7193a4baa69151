use crate::Error;
use serde_json::Value;
use std::time::Duration;

/// Per-call options for [`crate::LockClient::lock`].
///
/// Builder-style: start from [`LockOptions::default`] and override only what you need.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub(crate) lease_duration: Duration,
    pub(crate) prolong_lease_enabled: bool,
    pub(crate) prolong_every: Duration,
    pub(crate) trust_local_time: bool,
    pub(crate) wait_duration: Option<Duration>,
    pub(crate) max_retry_count: Option<u32>,
    pub(crate) additional_attributes: Value,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_millis(20_000),
            prolong_lease_enabled: true,
            prolong_every: Duration::from_millis(5_000),
            trust_local_time: false,
            wait_duration: None,
            max_retry_count: None,
            additional_attributes: Value::Object(Default::default()),
        }
    }
}

impl LockOptions {
    /// Declared lease length written on each acquire/steal. Default 20s.
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Whether to schedule a background renewal after acquisition. Default `true`.
    pub fn prolong_lease_enabled(mut self, enabled: bool) -> Self {
        self.prolong_lease_enabled = enabled;
        self
    }

    /// Renewal period; must satisfy `prolong_every < lease_duration / 2`. Default 5s.
    pub fn prolong_every(mut self, prolong_every: Duration) -> Self {
        self.prolong_every = prolong_every;
        self
    }

    /// Skip the default lease-duration wait when the observed record's lease has
    /// expired by the local clock. Default `false`.
    ///
    /// Accepts the tradeoff that this client's local clock may diverge from the clock
    /// that wrote the record.
    pub fn trust_local_time(mut self, trust_local_time: bool) -> Self {
        self.trust_local_time = trust_local_time;
        self
    }

    /// When `trust_local_time` is set, overrides the wait between re-reads. Unset
    /// defaults to zero (re-read immediately).
    pub fn wait_duration(mut self, wait_duration: Duration) -> Self {
        self.wait_duration = Some(wait_duration);
        self
    }

    /// Upper bound on acquisition attempts before failing with
    /// [`Error::LockNotGranted`]. Unset means unbounded. Note: checked after
    /// incrementing and compared with `>`, so the effective attempt count is
    /// `max_retry_count + 1`.
    pub fn max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = Some(max_retry_count);
        self
    }

    /// Opaque payload persisted verbatim with the record.
    pub fn additional_attributes(mut self, attributes: Value) -> Self {
        self.additional_attributes = attributes;
        self
    }

    /// Validates invariant 2: `prolong_every < lease_duration / 2` whenever
    /// `prolong_lease_enabled`. Must be checked before any backend call.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.lease_duration.is_zero() {
            return Err(Error::lock_options("lease_duration must be positive"));
        }
        if self.prolong_lease_enabled {
            if self.prolong_every.is_zero() {
                return Err(Error::lock_options("prolong_every must be positive"));
            }
            if self.prolong_every >= self.lease_duration / 2 {
                return Err(Error::lock_options(format!(
                    "prolong_every ({:?}) must be less than lease_duration / 2 ({:?})",
                    self.prolong_every,
                    self.lease_duration / 2
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        LockOptions::default().validate().unwrap();
    }

    #[test]
    fn rejects_prolong_every_at_half_lease_duration() {
        let opts = LockOptions::default()
            .lease_duration(Duration::from_millis(1000))
            .prolong_every(Duration::from_millis(500));
        assert!(matches!(
            opts.validate(),
            Err(Error::LockOptionsValidation(_))
        ));
    }

    #[test]
    fn accepts_prolong_every_just_under_half_lease_duration() {
        let opts = LockOptions::default()
            .lease_duration(Duration::from_millis(1000))
            .prolong_every(Duration::from_millis(499));
        opts.validate().unwrap();
    }

    #[test]
    fn ignores_prolong_every_when_prolongation_disabled() {
        let opts = LockOptions::default()
            .lease_duration(Duration::from_millis(1000))
            .prolong_every(Duration::from_millis(999))
            .prolong_lease_enabled(false);
        opts.validate().unwrap();
    }
}
