//! Lock types and configuration

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use super::path;
use crate::error::{Error, Result};

/// Scheme prefix of every state token handed out by the lock manager
pub const STATE_TOKEN_PREFIX: &str = "urn:uuid:";

/// Kind of access a lock grants. WebDAV only defines write locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    #[default]
    Write,
}

impl AccessType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "write",
        }
    }
}

impl FromStr for AccessType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "write" => Ok(Self::Write),
            other => Err(Error::InvalidInput(format!("unknown access type '{}'", other))),
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sharing mode of a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareMode {
    /// Any number of shared locks may coexist
    Shared,
    /// At most one holder, conflicts with everything it overlaps
    Exclusive,
}

impl ShareMode {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }

    /// Two modes are compatible only when both are shared
    pub fn is_compatible_with(&self, other: ShareMode) -> bool {
        *self == Self::Shared && other == Self::Shared
    }
}

impl FromStr for ShareMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shared" => Ok(Self::Shared),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(Error::InvalidInput(format!("unknown share mode '{}'", other))),
        }
    }
}

impl fmt::Display for ShareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Requested or granted lock lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockTimeout {
    Finite(Duration),
    Infinite,
}

impl LockTimeout {
    /// Shorthand for a finite timeout in whole seconds
    pub fn seconds(secs: u64) -> Self {
        Self::Finite(Duration::from_secs(secs))
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }

    /// The finite duration, if any
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Finite(d) => Some(*d),
            Self::Infinite => None,
        }
    }

    /// Clamp this timeout to an optional upper bound
    pub fn clamp_to(self, max: Option<Duration>) -> Self {
        match (self, max) {
            (_, None) => self,
            (Self::Infinite, Some(max)) => Self::Finite(max),
            (Self::Finite(d), Some(max)) => Self::Finite(d.min(max)),
        }
    }

    /// Expiration instant for a lock (re)started at `base`
    pub fn expiration_from(&self, base: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Infinite => max_expiration(),
            Self::Finite(d) => chrono::Duration::from_std(*d)
                .ok()
                .and_then(|d| base.checked_add_signed(d))
                .map(|exp| exp.min(max_expiration()))
                .unwrap_or_else(max_expiration),
        }
    }

    /// Millisecond representation used by the SQL store (`None` = infinite)
    ///
    /// The lock manager only grants whole-millisecond timeouts, so nothing
    /// it stores is truncated here.
    pub fn to_millis(&self) -> Option<i64> {
        self.as_duration()
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }

    /// Inverse of [`LockTimeout::to_millis`]
    pub fn from_millis(ms: Option<i64>) -> Result<Self> {
        match ms {
            None => Ok(Self::Infinite),
            Some(ms) => u64::try_from(ms)
                .map(|ms| Self::Finite(Duration::from_millis(ms)))
                .map_err(|_| Error::Corrupted(format!("negative timeout {}ms", ms))),
        }
    }
}

impl FromStr for LockTimeout {
    type Err = Error;

    /// Accepts `infinite` or a number of seconds
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("infinite") {
            return Ok(Self::Infinite);
        }
        let secs = s.strip_suffix('s').unwrap_or(s);
        secs.parse::<u64>()
            .map(Self::seconds)
            .map_err(|_| Error::InvalidInput(format!("invalid timeout '{}'", s)))
    }
}

impl fmt::Display for LockTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infinite => write!(f, "infinite"),
            Self::Finite(d) if d.subsec_nanos() == 0 => write!(f, "{}s", d.as_secs()),
            Self::Finite(d) => write!(f, "{}ms", d.as_millis()),
        }
    }
}

/// Far-future expiration given to locks with an infinite timeout
pub fn max_expiration() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A lock request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Root-relative path of the locked resource
    pub path: String,

    /// Reference of the resource as the client addressed it
    pub href: String,

    /// Whether the lock covers the whole subtree rooted at `path`
    pub recursive: bool,

    /// Opaque owner description supplied by the client
    pub owner: Option<String>,

    pub access_type: AccessType,

    pub share_mode: ShareMode,

    /// Requested lifetime
    pub timeout: LockTimeout,
}

impl Lock {
    /// Create a new non-recursive write lock request
    pub fn new(path: impl Into<String>, share_mode: ShareMode, timeout: LockTimeout) -> Self {
        let path = path.into();
        Self {
            href: path.clone(),
            path,
            recursive: false,
            owner: None,
            access_type: AccessType::Write,
            share_mode,
            timeout,
        }
    }

    /// Exclusive write lock with a five minute timeout
    pub fn exclusive(path: impl Into<String>) -> Self {
        Self::new(path, ShareMode::Exclusive, LockConfig::DEFAULT_TIMEOUT)
    }

    /// Shared write lock with a five minute timeout
    pub fn shared(path: impl Into<String>) -> Self {
        Self::new(path, ShareMode::Shared, LockConfig::DEFAULT_TIMEOUT)
    }

    /// Set whether the lock covers the subtree
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_href(mut self, href: impl Into<String>) -> Self {
        self.href = href.into();
        self
    }

    pub fn with_timeout(mut self, timeout: LockTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the request with its path normalized, validating it
    pub fn normalized(mut self) -> Result<Self> {
        let normalized = path::normalize(&self.path)?;
        if self.href == self.path {
            self.href = normalized.clone();
        }
        self.path = normalized;
        Ok(self)
    }

    /// Whether the scopes of this request and `existing` overlap
    pub fn overlaps(&self, existing: &ActiveLock) -> bool {
        existing.path == self.path
            || (existing.recursive && path::is_strict_ancestor(&existing.path, &self.path))
            || (self.recursive && path::is_strict_ancestor(&self.path, &existing.path))
    }

    /// Whether granting this request would violate `existing`
    pub fn conflicts_with(&self, existing: &ActiveLock) -> bool {
        self.overlaps(existing) && !self.share_mode.is_compatible_with(existing.share_mode)
    }
}

/// A granted lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveLock {
    /// Globally unique token identifying this grant
    pub state_token: String,

    pub path: String,

    pub href: String,

    pub recursive: bool,

    pub owner: Option<String>,

    pub access_type: AccessType,

    pub share_mode: ShareMode,

    /// Granted lifetime, after clamping
    pub timeout: LockTimeout,

    /// When the lock was granted
    pub issued: DateTime<Utc>,

    /// When the lock was last refreshed
    pub last_refresh: Option<DateTime<Utc>>,

    /// When the lock expires unless refreshed
    pub expiration: DateTime<Utc>,
}

impl ActiveLock {
    /// Grant `lock` at `now` under a freshly generated state token
    pub fn grant(lock: Lock, now: DateTime<Utc>) -> Self {
        Self {
            state_token: new_state_token(),
            expiration: lock.timeout.expiration_from(now),
            path: lock.path,
            href: lock.href,
            recursive: lock.recursive,
            owner: lock.owner,
            access_type: lock.access_type,
            share_mode: lock.share_mode,
            timeout: lock.timeout,
            issued: now,
            last_refresh: None,
        }
    }

    /// Copy of this lock refreshed at `now` with a new timeout
    pub fn refreshed(&self, timeout: LockTimeout, now: DateTime<Utc>) -> Self {
        Self {
            timeout,
            last_refresh: Some(now),
            expiration: timeout.expiration_from(now),
            ..self.clone()
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    /// Check if the lock is expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether this lock applies to a resource at `target`
    pub fn covers(&self, target: &str) -> bool {
        self.path == target || (self.recursive && path::is_strict_ancestor(&self.path, target))
    }
}

/// Generate a new, never reused, state token
pub fn new_state_token() -> String {
    format!("{}{}", STATE_TOKEN_PREFIX, Uuid::new_v4())
}

/// How the cleanup timer delay is rounded up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationRounding {
    /// Round up to the next whole second
    #[default]
    Second,
    /// Round up to the next 100 milliseconds
    HundredMilliseconds,
    /// No rounding
    Exact,
}

impl ExpirationRounding {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::HundredMilliseconds => "100ms",
            Self::Exact => "exact",
        }
    }

    /// Round `delay` up to this policy's granularity
    pub fn round_up(&self, delay: Duration) -> Duration {
        let step = match self {
            Self::Second => Duration::from_secs(1),
            Self::HundredMilliseconds => Duration::from_millis(100),
            Self::Exact => return delay,
        };
        let step_ns = step.as_nanos();
        let rounded = delay.as_nanos().div_ceil(step_ns) * step_ns;
        Duration::from_nanos(u64::try_from(rounded).unwrap_or(u64::MAX))
    }
}

impl FromStr for ExpirationRounding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "second" => Ok(Self::Second),
            "100ms" | "hundred_milliseconds" => Ok(Self::HundredMilliseconds),
            "exact" => Ok(Self::Exact),
            other => Err(Error::InvalidInput(format!(
                "unknown rounding '{}' (expected second, 100ms or exact)",
                other
            ))),
        }
    }
}

impl fmt::Display for ExpirationRounding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration for the lock manager
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Timeout used when a caller has no explicit preference
    pub default_timeout: LockTimeout,

    /// Upper bound applied to every granted or refreshed timeout
    pub max_timeout: Option<Duration>,

    /// Rounding of the cleanup timer
    pub rounding: ExpirationRounding,

    /// Capacity of the lifecycle event channel
    pub event_capacity: usize,
}

impl LockConfig {
    pub const DEFAULT_TIMEOUT: LockTimeout = LockTimeout::Finite(Duration::from_secs(300));
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout: Self::DEFAULT_TIMEOUT,
            max_timeout: None,
            rounding: ExpirationRounding::Second,
            event_capacity: 256,
        }
    }
}

impl LockConfig {
    /// Set the default timeout
    pub fn with_default_timeout(mut self, timeout: LockTimeout) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the maximum timeout
    pub fn with_max_timeout(mut self, max: Duration) -> Self {
        self.max_timeout = Some(max);
        self
    }

    /// Set the cleanup timer rounding
    pub fn with_rounding(mut self, rounding: ExpirationRounding) -> Self {
        self.rounding = rounding;
        self
    }
}

/// Result of an acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lock was granted
    Acquired(ActiveLock),
    /// Every existing lock the request conflicts with
    Conflict(Vec<ActiveLock>),
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    /// The granted lock, if any
    pub fn acquired(self) -> Option<ActiveLock> {
        match self {
            Self::Acquired(lock) => Some(lock),
            Self::Conflict(_) => None,
        }
    }

    /// The conflicting locks, empty on success
    pub fn conflicts(&self) -> &[ActiveLock] {
        match self {
            Self::Acquired(_) => &[],
            Self::Conflict(locks) => locks,
        }
    }
}

/// Result of a refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(ActiveLock),
    /// The token is unknown, released or expired
    NotFound,
}

impl RefreshOutcome {
    pub fn refreshed(self) -> Option<ActiveLock> {
        match self {
            Self::Refreshed(lock) => Some(lock),
            Self::NotFound => None,
        }
    }
}

/// Result of a release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    /// The lock was removed
    Released,
    /// No lock with that token exists (already released or expired)
    NoLock,
    /// The lock exists but does not cover the addressed resource
    InvalidLockRange,
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Released => write!(f, "released"),
            Self::NoLock => write!(f, "no_lock"),
            Self::InvalidLockRange => write!(f, "invalid_lock_range"),
        }
    }
}

/// Result of a write-access check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAccess {
    Granted,
    /// Locks whose tokens were not submitted
    Denied(Vec<ActiveLock>),
}

impl WriteAccess {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(path: &str, mode: ShareMode, recursive: bool) -> ActiveLock {
        ActiveLock::grant(
            Lock::new(path, mode, LockTimeout::seconds(60)).recursive(recursive),
            Utc::now(),
        )
    }

    #[test]
    fn test_state_tokens_are_unique_urns() {
        let a = new_state_token();
        let b = new_state_token();
        assert!(a.starts_with(STATE_TOKEN_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn test_grant_computes_expiration() {
        let now = Utc::now();
        let lock = ActiveLock::grant(Lock::exclusive("/a").with_timeout(LockTimeout::seconds(60)), now);
        assert_eq!(lock.issued, now);
        assert_eq!(lock.last_refresh, None);
        assert_eq!(lock.expiration, now + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_refresh_recomputes_from_refresh_time() {
        let issued = Utc::now() - chrono::Duration::seconds(30);
        let lock = ActiveLock::grant(Lock::exclusive("/a").with_timeout(LockTimeout::seconds(60)), issued);
        let now = Utc::now();
        let refreshed = lock.refreshed(LockTimeout::seconds(10), now);
        assert_eq!(refreshed.state_token, lock.state_token);
        assert_eq!(refreshed.issued, issued);
        assert_eq!(refreshed.last_refresh, Some(now));
        assert_eq!(refreshed.expiration, now + chrono::Duration::seconds(10));
    }

    #[test]
    fn test_infinite_timeout_uses_sentinel() {
        let lock = ActiveLock::grant(Lock::shared("/a").with_timeout(LockTimeout::Infinite), Utc::now());
        assert_eq!(lock.expiration, max_expiration());
        assert!(!lock.is_expired());
    }

    #[test]
    fn test_timeout_clamp() {
        let max = Some(Duration::from_secs(120));
        assert_eq!(LockTimeout::Infinite.clamp_to(max), LockTimeout::seconds(120));
        assert_eq!(LockTimeout::seconds(600).clamp_to(max), LockTimeout::seconds(120));
        assert_eq!(LockTimeout::seconds(60).clamp_to(max), LockTimeout::seconds(60));
        assert_eq!(LockTimeout::Infinite.clamp_to(None), LockTimeout::Infinite);
    }

    #[test]
    fn test_timeout_parse_and_display() {
        assert_eq!("infinite".parse::<LockTimeout>().unwrap(), LockTimeout::Infinite);
        assert_eq!("60".parse::<LockTimeout>().unwrap(), LockTimeout::seconds(60));
        assert_eq!("60s".parse::<LockTimeout>().unwrap(), LockTimeout::seconds(60));
        assert!("soon".parse::<LockTimeout>().is_err());
        assert_eq!(LockTimeout::seconds(60).to_string(), "60s");
        assert_eq!(LockTimeout::Finite(Duration::from_millis(250)).to_string(), "250ms");
    }

    #[test]
    fn test_timeout_millis_roundtrip_for_storage() {
        assert_eq!(LockTimeout::Infinite.to_millis(), None);
        assert_eq!(LockTimeout::from_millis(Some(1500)).unwrap(), LockTimeout::Finite(Duration::from_millis(1500)));
        assert!(LockTimeout::from_millis(Some(-1)).is_err());
    }

    #[test]
    fn test_rounding() {
        let d = Duration::from_millis(1210);
        assert_eq!(ExpirationRounding::Second.round_up(d), Duration::from_secs(2));
        assert_eq!(ExpirationRounding::HundredMilliseconds.round_up(d), Duration::from_millis(1300));
        assert_eq!(ExpirationRounding::Exact.round_up(d), d);
        assert_eq!(ExpirationRounding::Second.round_up(Duration::ZERO), Duration::ZERO);
        assert_eq!(ExpirationRounding::Second.round_up(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn test_share_mode_compatibility() {
        assert!(ShareMode::Shared.is_compatible_with(ShareMode::Shared));
        assert!(!ShareMode::Shared.is_compatible_with(ShareMode::Exclusive));
        assert!(!ShareMode::Exclusive.is_compatible_with(ShareMode::Shared));
        assert!(!ShareMode::Exclusive.is_compatible_with(ShareMode::Exclusive));
    }

    #[test]
    fn test_overlap_rules() {
        let recursive_root = active("/docs", ShareMode::Exclusive, true);
        let flat_root = active("/docs", ShareMode::Exclusive, false);
        let child = Lock::shared("/docs/readme.txt");

        assert!(child.conflicts_with(&recursive_root));
        assert!(!child.conflicts_with(&flat_root));

        let deep_request = Lock::exclusive("/docs").recursive(true);
        let existing_child = active("/docs/a/b", ShareMode::Shared, false);
        assert!(deep_request.conflicts_with(&existing_child));
        assert!(!Lock::exclusive("/docs").conflicts_with(&existing_child));

        let sibling = active("/docs2", ShareMode::Exclusive, true);
        assert!(!deep_request.conflicts_with(&sibling));
    }

    #[test]
    fn test_covers() {
        let lock = active("/a", ShareMode::Exclusive, true);
        assert!(lock.covers("/a"));
        assert!(lock.covers("/a/b/c"));
        assert!(!lock.covers("/ab"));
        assert!(!active("/a", ShareMode::Exclusive, false).covers("/a/b"));
    }

    #[test]
    fn test_normalized_request_keeps_explicit_href() {
        let lock = Lock::exclusive("docs//a/").normalized().unwrap();
        assert_eq!(lock.path, "/docs/a");
        assert_eq!(lock.href, "/docs/a");

        let lock = Lock::exclusive("docs/a")
            .with_href("http://host/dav/docs/a")
            .normalized()
            .unwrap();
        assert_eq!(lock.href, "http://host/dav/docs/a");
    }

    #[test]
    fn test_lock_config_builder() {
        let config = LockConfig::default()
            .with_default_timeout(LockTimeout::seconds(60))
            .with_max_timeout(Duration::from_secs(3600))
            .with_rounding(ExpirationRounding::HundredMilliseconds);

        assert_eq!(config.default_timeout, LockTimeout::seconds(60));
        assert_eq!(config.max_timeout, Some(Duration::from_secs(3600)));
        assert_eq!(config.rounding, ExpirationRounding::HundredMilliseconds);
    }
}
