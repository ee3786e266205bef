//! Best-configuration search over a connector's encoders, candidate CRTCs and the device's planes
//! (spec §4.C "Best-configuration search").

use std::sync::Arc;

use drm_fourcc::DrmFourcc as Fourcc;

use super::Connector;
use crate::object::{Crtc, Encoder, Plane, PlaneType};

/// One viable (encoder, crtc, primary plane[, cursor plane]) combination, plus the format the
/// primary plane should be driven with.
#[derive(Debug)]
pub(crate) struct Candidate {
    pub encoder: Arc<Encoder>,
    pub crtc: Arc<Crtc>,
    pub primary_plane: Arc<Plane>,
    pub primary_format: Fourcc,
    pub cursor_plane: Option<Arc<Plane>>,
}

/// Searches for the best configuration for `connector`, given the formats its assigned renderer
/// can produce.
///
/// A crtc or plane already bound to a *different* connector is never a candidate; one already
/// bound to `connector` itself (e.g. during a `setMode` re-search) is fair game. Among all valid
/// combinations the one whose primary plane advertises the most modifiers for its chosen format
/// wins; ties are broken by the lowest encoder, then crtc, then plane id, so the search is
/// deterministic across runs.
pub(crate) fn find_best(connector: &Arc<Connector>, renderer_formats: &[Fourcc]) -> Option<Candidate> {
    if connector.is_leased() {
        return None;
    }

    let device = connector.device()?;
    let mut best: Option<(u32, Candidate)> = None;

    for encoder in connector.encoders() {
        for crtc_handle in encoder.possible_crtcs() {
            let Some(crtc) = device.crtcs().iter().find(|c| c.handle() == *crtc_handle) else {
                continue;
            };
            if crtc.is_leased() || !is_free_or_owned(crtc.current_connector(), connector) {
                continue;
            }

            for plane in device.planes() {
                if plane.plane_type() != PlaneType::Primary {
                    continue;
                }
                if !plane.possible_crtcs().contains(crtc_handle) {
                    continue;
                }
                if plane.is_leased() || !is_free_or_owned(plane.current_connector(), connector) {
                    continue;
                }

                let Some((format, diversity)) = best_format(plane, renderer_formats) else {
                    continue;
                };

                let candidate = Candidate {
                    encoder: encoder.clone(),
                    crtc: crtc.clone(),
                    primary_plane: plane.clone(),
                    primary_format: format,
                    cursor_plane: find_cursor_plane(&device, crtc.handle(), connector),
                };

                let ids = (
                    u32::from(encoder.handle()),
                    u32::from(crtc.handle()),
                    u32::from(plane.handle()),
                );
                let better = match &best {
                    None => true,
                    Some((best_diversity, best_candidate)) => {
                        let best_ids = (
                            u32::from(best_candidate.encoder.handle()),
                            u32::from(best_candidate.crtc.handle()),
                            u32::from(best_candidate.primary_plane.handle()),
                        );
                        diversity > *best_diversity || (diversity == *best_diversity && ids < best_ids)
                    }
                };
                if better {
                    best = Some((diversity, candidate));
                }
            }
        }
    }

    best.map(|(_, candidate)| candidate)
}

/// Among the formats both the renderer can produce and `plane` advertises, returns the one with
/// the most distinct modifiers together with that count ("modifier diversity").
fn best_format(plane: &Plane, renderer_formats: &[Fourcc]) -> Option<(Fourcc, u32)> {
    renderer_formats
        .iter()
        .filter_map(|wanted| {
            let count = plane.formats().iter().filter(|f| f.code == *wanted).count() as u32;
            (count > 0).then_some((*wanted, count))
        })
        .max_by_key(|(_, count)| *count)
}

fn find_cursor_plane(
    device: &crate::object::Device,
    crtc: drm::control::crtc::Handle,
    connector: &Arc<Connector>,
) -> Option<Arc<Plane>> {
    device
        .planes()
        .iter()
        .filter(|plane| plane.plane_type() == PlaneType::Cursor)
        .filter(|plane| plane.possible_crtcs().contains(&crtc))
        .filter(|plane| !plane.is_leased() && is_free_or_owned(plane.current_connector(), connector))
        .min_by_key(|plane| u32::from(plane.handle()))
        .cloned()
}

fn is_free_or_owned(owner: Option<Arc<Connector>>, connector: &Arc<Connector>) -> bool {
    match owner {
        None => true,
        Some(owner) => Arc::ptr_eq(&owner, connector),
    }
}
