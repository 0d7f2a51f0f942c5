//! Option negotiation (RFC 2347, 2348, 2349)
//!
//! Negotiation happens in two steps. [`OptionSet::from_request`] validates
//! the syntax of the recognized options and rejects duplicates. Then
//! [`OptionSet::negotiate`] applies the session's limits and produces the
//! values the transfer will use along with the set echoed in the OACK.
//!
//! The policies differ per option:
//!
//! - `blksize` outside 8..=65464 is an option error. A valid value above
//!   the session ceiling is clamped down and the clamped value is echoed.
//! - `timeout` outside 1..=255 or above the server's ceiling is dropped.
//! - `tsize` is advisory on a write. On a read the server's own size is
//!   echoed, whatever the client sent.

use std::fmt;
use std::time::Duration;

use crate::protocol::{
    DEFAULT_BLOCK_SIZE, MAX_BLOCK_ID, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, RawOption, RequestKind, TftpError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKind {
    /// `blksize`, RFC 2348
    BlockSize,
    /// `timeout`, RFC 2349
    Timeout,
    /// `tsize`, RFC 2349
    TransferSize,
}

impl OptionKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "blksize" => Some(Self::BlockSize),
            "timeout" => Some(Self::Timeout),
            "tsize" => Some(Self::TransferSize),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::BlockSize => "blksize",
            Self::Timeout => "timeout",
            Self::TransferSize => "tsize",
        }
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A recognized option with its requested value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedOption {
    BlockSize(u16),
    /// Kept as requested, range is checked at negotiation
    Timeout(u64),
    TransferSize(u64),
}

impl RequestedOption {
    pub fn kind(self) -> OptionKind {
        match self {
            Self::BlockSize(_) => OptionKind::BlockSize,
            Self::Timeout(_) => OptionKind::Timeout,
            Self::TransferSize(_) => OptionKind::TransferSize,
        }
    }
}

/// Recognized options of one request, in request order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    options: Vec<RequestedOption>,
}

impl OptionSet {
    /// Validate the raw options of a request
    ///
    /// Unknown names are skipped. A recognized name appearing twice or a
    /// malformed `blksize`/`tsize` value is an option error. A malformed
    /// `timeout` is dropped like any other unacceptable timeout.
    pub fn from_request(raw: &[RawOption]) -> Result<Self, TftpError> {
        let mut set = Self::default();
        let mut seen = Vec::with_capacity(3);

        for option in raw {
            let Some(kind) = OptionKind::from_name(&option.name) else {
                tracing::debug!("Ignoring unknown option {}={}", option.name, option.value);
                continue;
            };

            if seen.contains(&kind) {
                return Err(TftpError::option(format!("Option '{}' given more than once", kind)));
            }
            seen.push(kind);

            let value = option.value.trim();
            let requested = match kind {
                OptionKind::BlockSize => {
                    let size = value
                        .parse::<u32>()
                        .ok()
                        .filter(|n| (u32::from(MIN_BLOCK_SIZE)..=u32::from(MAX_BLOCK_SIZE)).contains(n))
                        .ok_or_else(|| TftpError::option(format!("Invalid block size '{}'", option.value)))?;
                    RequestedOption::BlockSize(size as u16)
                }
                OptionKind::Timeout => match value.parse::<u64>() {
                    Ok(seconds) => RequestedOption::Timeout(seconds),
                    Err(_) => {
                        tracing::debug!("Dropping malformed timeout '{}'", option.value);
                        continue;
                    }
                },
                OptionKind::TransferSize => {
                    let size = value
                        .parse::<u64>()
                        .map_err(|_| TftpError::option(format!("Invalid transfer size '{}'", option.value)))?;
                    RequestedOption::TransferSize(size)
                }
            };

            set.options.push(requested);
        }

        Ok(set)
    }

    pub fn get(&self, kind: OptionKind) -> Option<RequestedOption> {
        self.options.iter().copied().find(|option| option.kind() == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = RequestedOption> + '_ {
        self.options.iter().copied()
    }

    /// Apply session limits and build the values the transfer runs with
    ///
    /// `local_size` is the size of the file being served and is only used
    /// for read requests.
    pub fn negotiate(&self, kind: RequestKind, limits: &SessionLimits, local_size: Option<u64>) -> Negotiated {
        let mut negotiated = Negotiated {
            block_size: limits.default_block_size(),
            timeout: limits.default_timeout,
            transfer_size: match kind {
                RequestKind::Read => local_size,
                RequestKind::Write => None,
            },
            acknowledged: Vec::new(),
        };

        for option in self.iter() {
            match option {
                RequestedOption::BlockSize(requested) => {
                    let size = requested.min(limits.max_block_size);
                    if size < requested {
                        tracing::debug!("Clamping blksize {} to {}", requested, size);
                    }
                    negotiated.block_size = size;
                    negotiated.acknowledged.push((OptionKind::BlockSize, u64::from(size)));
                }
                RequestedOption::Timeout(seconds) => {
                    if (1..=255).contains(&seconds) && seconds <= limits.default_timeout.as_secs() {
                        negotiated.timeout = Duration::from_secs(seconds);
                        negotiated.acknowledged.push((OptionKind::Timeout, seconds));
                    } else {
                        tracing::debug!("Dropping timeout option {}", seconds);
                    }
                }
                RequestedOption::TransferSize(requested) => {
                    let size = match kind {
                        RequestKind::Write => {
                            negotiated.transfer_size = Some(requested);
                            requested
                        }
                        RequestKind::Read => match local_size {
                            Some(size) => size,
                            None => continue,
                        },
                    };
                    negotiated.acknowledged.push((OptionKind::TransferSize, size));
                }
            }
        }

        negotiated
    }
}

/// Bounds a session negotiates within
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Highest block size this session may use
    pub max_block_size: u16,
    /// Timeout used when none is negotiated, also the highest accepted
    pub default_timeout: Duration,
}

impl SessionLimits {
    pub fn new(max_block_size: u16, default_timeout: Duration) -> Self {
        Self {
            max_block_size: max_block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE),
            default_timeout,
        }
    }

    /// Block size used without a `blksize` option
    pub fn default_block_size(&self) -> u16 {
        DEFAULT_BLOCK_SIZE.min(self.max_block_size)
    }
}

/// Outcome of option negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub block_size: u16,
    pub timeout: Duration,
    /// Authoritative for reads, advisory for writes
    pub transfer_size: Option<u64>,
    /// Options to echo in the OACK, in request order
    pub acknowledged: Vec<(OptionKind, u64)>,
}

impl Negotiated {
    /// Whether an OACK must be sent before the transfer starts
    pub fn needs_oack(&self) -> bool {
        !self.acknowledged.is_empty()
    }

    /// Name/value pairs in OACK wire form
    pub fn oack_options(&self) -> Vec<(&'static str, String)> {
        self.acknowledged
            .iter()
            .map(|(kind, value)| (kind.name(), value.to_string()))
            .collect()
    }

    /// Reject transfers that need more blocks than a block id can count
    pub fn check_transfer_size(&self) -> Result<(), TftpError> {
        match self.transfer_size {
            Some(size) => check_transfer_size(size, self.block_size),
            None => Ok(()),
        }
    }
}

/// Number of DATA blocks needed for `size` bytes, counting the final short
/// (possibly empty) block
pub fn blocks_required(size: u64, block_size: u16) -> u64 {
    size / u64::from(block_size) + 1
}

pub fn check_transfer_size(size: u64, block_size: u16) -> Result<(), TftpError> {
    if blocks_required(size, block_size) > u64::from(MAX_BLOCK_ID) {
        return Err(TftpError::access_violation("File too large for this block size"));
    }
    Ok(())
}
