//! Format negotiation between a stream and its consumer.
//!
//! The pipeline offers `(fourcc, optional modifier set)` candidates in
//! preference order together with a size and refresh range; the consumer
//! answers with one concrete choice. DMA-BUF choices are verified with a
//! dry-run allocation before they stick; a failing modifier is removed from
//! the offer and the consumer picks again.

use drm_fourcc::{DrmFourcc, DrmModifier};
use thiserror::Error;
use tracing::debug;

use crate::utils::Size;

use super::source::CaptureSource;

/// One format the pipeline can produce. `modifiers == None` means shared
/// memory; `Some` lists the acceptable DMA-BUF layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatCandidate {
    pub fourcc: DrmFourcc,
    pub modifiers: Option<Vec<DrmModifier>>,
}

/// What the pipeline sends to the consumer when (re)negotiating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationOffer {
    /// Candidates in descending preference order.
    pub candidates: Vec<FormatCandidate>,
    pub min_size: Size<i32>,
    pub max_size: Size<i32>,
    /// Refresh range in mHz.
    pub min_refresh: u32,
    pub max_refresh: u32,
}

/// The consumer's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatChoice {
    pub fourcc: DrmFourcc,
    /// `None` selects the shared-memory candidate.
    pub modifier: Option<DrmModifier>,
    pub size: Size<i32>,
    /// Frame rate in mHz.
    pub refresh: u32,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("no format in common with the consumer")]
    NoCommonFormat,
    #[error("consumer chose a format outside the offer: {0}")]
    InvalidChoice(&'static str),
    #[error("negotiation timeout")]
    Timeout,
}

/// Build the initial offer for a source. `modifiers` lists the DMA-BUF
/// layouts the render device supports for the source's format; an empty
/// list offers shared memory only.
pub fn offer_for(source: &dyn CaptureSource, modifiers: &[DrmModifier]) -> NegotiationOffer {
    let fourcc = source.pixel_format();
    let size = source.texture_size();
    let refresh = source.refresh_rate();

    let mut candidates = Vec::with_capacity(2);
    if !modifiers.is_empty() {
        candidates.push(FormatCandidate {
            fourcc,
            modifiers: Some(modifiers.to_vec()),
        });
    }
    candidates.push(FormatCandidate {
        fourcc,
        modifiers: None,
    });

    NegotiationOffer {
        candidates,
        min_size: size,
        max_size: size,
        min_refresh: 1,
        max_refresh: refresh.max(1),
    }
}

/// Check a consumer choice against the offer.
pub fn validate_choice(
    offer: &NegotiationOffer,
    choice: &FormatChoice,
) -> Result<(), NegotiationError> {
    let candidate = offer
        .candidates
        .iter()
        .find(|c| c.fourcc == choice.fourcc && c.modifiers.is_some() == choice.modifier.is_some())
        .ok_or(NegotiationError::InvalidChoice("format not offered"))?;
    if let (Some(set), Some(modifier)) = (&candidate.modifiers, choice.modifier) {
        if !set.contains(&modifier) {
            return Err(NegotiationError::InvalidChoice("modifier not offered"));
        }
    }
    if choice.size.w < offer.min_size.w
        || choice.size.h < offer.min_size.h
        || choice.size.w > offer.max_size.w
        || choice.size.h > offer.max_size.h
    {
        return Err(NegotiationError::InvalidChoice("size out of range"));
    }
    if choice.refresh < offer.min_refresh || choice.refresh > offer.max_refresh {
        return Err(NegotiationError::InvalidChoice("refresh out of range"));
    }
    Ok(())
}

/// Drop a modifier whose dry-run allocation failed. Candidates whose
/// modifier set empties are removed entirely, leaving the shared-memory
/// fallback. Returns `false` when nothing is left to offer.
pub fn remove_modifier(
    offer: &mut NegotiationOffer,
    fourcc: DrmFourcc,
    modifier: DrmModifier,
) -> bool {
    debug!(?fourcc, ?modifier, "dropping modifier after failed dry-run");
    for candidate in &mut offer.candidates {
        if candidate.fourcc != fourcc {
            continue;
        }
        if let Some(ref mut set) = candidate.modifiers {
            set.retain(|&m| m != modifier);
        }
    }
    offer
        .candidates
        .retain(|c| c.modifiers.as_ref().map(|s| !s.is_empty()).unwrap_or(true));
    !offer.candidates.is_empty()
}

/// Bytes per pixel of the formats the pipeline produces.
pub fn bytes_per_pixel(fourcc: DrmFourcc) -> u32 {
    match fourcc {
        DrmFourcc::Argb8888
        | DrmFourcc::Xrgb8888
        | DrmFourcc::Abgr8888
        | DrmFourcc::Xbgr8888 => 4,
        // The sources in this crate only render 32-bit formats.
        other => {
            debug!(?other, "assuming 4 bytes per pixel");
            4
        }
    }
}

/// Shared-memory buffers are single-plane linear.
pub fn shm_stride(fourcc: DrmFourcc, width: i32) -> u32 {
    width.max(0) as u32 * bytes_per_pixel(fourcc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> NegotiationOffer {
        NegotiationOffer {
            candidates: vec![
                FormatCandidate {
                    fourcc: DrmFourcc::Xrgb8888,
                    modifiers: Some(vec![DrmModifier::Linear, DrmModifier::Invalid]),
                },
                FormatCandidate {
                    fourcc: DrmFourcc::Xrgb8888,
                    modifiers: None,
                },
            ],
            min_size: Size::from((100, 100)),
            max_size: Size::from((100, 100)),
            min_refresh: 1,
            max_refresh: 60_000,
        }
    }

    fn choice(modifier: Option<DrmModifier>) -> FormatChoice {
        FormatChoice {
            fourcc: DrmFourcc::Xrgb8888,
            modifier,
            size: Size::from((100, 100)),
            refresh: 60_000,
        }
    }

    #[test]
    fn accepts_offered_choices() {
        let offer = offer();
        assert!(validate_choice(&offer, &choice(Some(DrmModifier::Linear))).is_ok());
        assert!(validate_choice(&offer, &choice(None)).is_ok());
    }

    #[test]
    fn rejects_unoffered_modifier() {
        let mut o = offer();
        assert!(remove_modifier(&mut o, DrmFourcc::Xrgb8888, DrmModifier::Linear));
        assert!(validate_choice(&o, &choice(Some(DrmModifier::Linear))).is_err());
        assert!(validate_choice(&o, &choice(Some(DrmModifier::Invalid))).is_ok());
    }

    #[test]
    fn falls_back_to_shm_when_modifiers_run_out() {
        let mut o = offer();
        assert!(remove_modifier(&mut o, DrmFourcc::Xrgb8888, DrmModifier::Linear));
        assert!(remove_modifier(&mut o, DrmFourcc::Xrgb8888, DrmModifier::Invalid));
        assert_eq!(o.candidates.len(), 1);
        assert!(o.candidates[0].modifiers.is_none());
        assert!(validate_choice(&o, &choice(None)).is_ok());
    }

    #[test]
    fn rejects_size_out_of_range() {
        let offer = offer();
        let mut c = choice(None);
        c.size = Size::from((50, 50));
        assert!(validate_choice(&offer, &c).is_err());
    }

    #[test]
    fn stride_follows_width() {
        assert_eq!(shm_stride(DrmFourcc::Xrgb8888, 100), 400);
        assert_eq!(shm_stride(DrmFourcc::Argb8888, 0), 0);
    }
}
