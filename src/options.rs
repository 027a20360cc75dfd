//! Option negotiation (RFC 2347) for the `blksize` and `tsize` extensions.
//!
//! The responder side applies a fixed policy to the options carried by an
//! RRQ/WRQ and produces the subset echoed in the OACK; the requester side
//! validates a received OACK against what it asked for.

use tracing::debug;

use crate::protocol::{DEF_BLKSIZE, MAX_BLKSIZE, MIN_BLKSIZE, OptionPair, find_option};

pub(crate) const OPT_BLKSIZE: &str = "blksize";
pub(crate) const OPT_TSIZE: &str = "tsize";

/// The outcome of applying negotiation policy to a request's option list.
#[derive(Debug, Default)]
pub(crate) struct Negotiated {
    /// The options to echo in an OACK, in request order, spelled the way the
    /// requester spelled them. Empty means no OACK is sent and the transfer
    /// runs as plain RFC 1350.
    pub reply: Vec<OptionPair>,
    /// Block size in effect for the transfer.
    pub blksize: usize,
    /// Transfer size: the actual file size when we are serving a read, or the
    /// peer's declared size when receiving a write.
    pub tsize: Option<u64>,
}

/// Apply responder policy to the requested options.
///
/// `read_size` is the size of the file being served for an RRQ, and `None`
/// when receiving a WRQ. Unsupported option names are dropped without
/// comment; a `blksize` that does not parse is dropped; a parseable `blksize`
/// is clamped into `[MIN_BLKSIZE, MAX_BLKSIZE]` and echoed clamped.
pub(crate) fn negotiate(requested: &[OptionPair], read_size: Option<u64>) -> Negotiated {
    let mut out = Negotiated {
        blksize: DEF_BLKSIZE,
        ..Default::default()
    };

    for (i, opt) in requested.iter().enumerate() {
        // Duplicate names: only the last occurrence counts.
        if requested[i + 1..].iter().any(|o| o.name.eq_ignore_ascii_case(&opt.name)) {
            continue;
        }

        if opt.is_named(OPT_BLKSIZE) {
            let Some(asked) = opt.value_u64() else {
                debug!("dropping unparseable blksize {:?}", opt.value_lossy());
                continue;
            };
            let clamped = (asked as usize).clamp(MIN_BLKSIZE, MAX_BLKSIZE);
            out.blksize = clamped;
            out.reply.push(OptionPair::new(opt.name.clone(), clamped.to_string()));
        } else if opt.is_named(OPT_TSIZE) {
            let Some(declared) = opt.value_u64() else {
                debug!("dropping unparseable tsize {:?}", opt.value_lossy());
                continue;
            };
            match read_size {
                // Serving a read: tsize 0 asks for the real size, anything
                // else is echoed back untouched.
                Some(actual) if declared == 0 => {
                    out.tsize = Some(actual);
                    out.reply.push(OptionPair::new(opt.name.clone(), actual.to_string()));
                }
                Some(_) | None => {
                    out.tsize = Some(declared);
                    out.reply.push(OptionPair::new(opt.name.clone(), opt.value.clone()));
                }
            }
        } else {
            debug!("dropping unsupported option {}", opt.name_lossy());
        }
    }

    out
}

/// Option values a requester applies to its session after a valid OACK.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct AppliedOptions {
    pub blksize: Option<usize>,
    pub tsize: Option<u64>,
}

/// Validate an OACK against the options we requested.
///
/// Every acknowledged option must be one we asked for; a granted `blksize`
/// must parse, stay within the legal range and not exceed what we requested.
/// An empty OACK is a valid (if unusual) answer meaning nothing was granted.
pub(crate) fn validate_oack(oack: &[OptionPair], requested: &[OptionPair]) -> Result<AppliedOptions, String> {
    let mut applied = AppliedOptions::default();

    for opt in oack {
        let Some(asked) = find_option(requested, &opt.name_lossy()) else {
            return Err(format!("server granted option {} we did not request", opt.name_lossy()));
        };

        if opt.is_named(OPT_BLKSIZE) {
            let Some(granted) = opt.value_u64() else {
                return Err(format!("unparseable blksize {:?} in OACK", opt.value_lossy()));
            };
            let granted = granted as usize;
            if !(MIN_BLKSIZE..=MAX_BLKSIZE).contains(&granted) {
                return Err(format!("blksize {granted} outside the legal range"));
            }
            if let Some(limit) = asked.value_u64()
                && granted as u64 > limit
            {
                return Err(format!("server granted blksize {granted} above requested {limit}"));
            }
            applied.blksize = Some(granted);
        } else if opt.is_named(OPT_TSIZE) {
            let Some(size) = opt.value_u64() else {
                return Err(format!("unparseable tsize {:?} in OACK", opt.value_lossy()));
            };
            applied.tsize = Some(size);
        } else {
            // We only ever request blksize and tsize, so a matched name here
            // means the request itself was built wrong.
            return Err(format!("unsupported option {} in OACK", opt.name_lossy()));
        }
    }

    Ok(applied)
}
