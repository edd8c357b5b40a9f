use tracktally_core::{RenderItem, StatesOrdering};

use crate::ResolvedTrack;

/// Partition an already-sorted track sequence into z-order layers.
///
/// A `LayerMark` precedes the first track of each maximal run sharing an
/// effective z-order, and only under the z-order ordering mode. A track
/// without a z-order of its own continues the current layer; it never
/// starts one. A leading track without a z-order starts unlabeled layer
/// tracking, so the first mark appears at the first defined z-order.
/// Single linear pass.
pub fn group_layers(ordering: StatesOrdering, tracks: &[ResolvedTrack]) -> Vec<RenderItem> {
    let z_mode = ordering.is_z_order();
    let mut current: Option<i64> = None;
    let mut items = Vec::with_capacity(tracks.len());

    for track in tracks {
        let effective = track.z_order.or(current);
        if z_mode && effective != current {
            if let Some(z_order) = effective {
                items.push(RenderItem::LayerMark { z_order });
            }
        }
        current = effective;
        items.push(RenderItem::Track {
            client_id: track.client_id,
            frame_count: track.frame_count,
        });
    }

    items
}
