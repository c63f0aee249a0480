//! Component G: per-image animation scheduling (§5).
//!
//! The host drives animation by calling `Store::advance` with its current
//! wall-clock time on every draw cycle. `advance` is idempotent for repeat
//! calls at the same `now` (P7) and safe to call at arbitrary, possibly
//! large, time jumps: elapsed time beyond a full loop is first reduced
//! modulo `total_duration` so the inner stepping loop never iterates more
//! than one lap.

use crate::model::{AnimationState, Image, Millis};

/// Advance `image`'s current frame to reflect `now`, per §5.
///
/// No-op for `Unset`/`Stopped` images, for images with fewer than two
/// frames, or for images whose frames are all gapless (nothing to
/// schedule: `total_duration == 0`).
pub fn advance_image(image: &mut Image, now: Millis) {
    if !matches!(image.animation_state, AnimationState::Looping | AnimationState::Loading) {
        return;
    }
    let last = if image.animation_state == AnimationState::Loading {
        image.last_uploaded_frame_index()
    } else {
        image.last_frame_index()
    };
    if last < 2 {
        return;
    }
    if image.current_frame == 0 {
        image.current_frame = 1;
        image.current_frame_time = now;
    }
    if image.total_duration <= 0 {
        // All frames gapless (or a single frame): nothing to schedule, but
        // still register a redraw deadline so the host doesn't spin forever
        // waiting on one that will never come.
        image.next_redraw = 0;
        return;
    }

    let start_frame = image.current_frame;
    let mut passed_ms = now.saturating_sub(image.current_frame_time);
    if passed_ms <= 0 {
        // Already up to date (or `now` moved backwards, which shouldn't
        // happen but is handled as a no-op rather than panicking).
        recompute_next_redraw(image, last);
        return;
    }

    // §5: when looping, time elapsed across more than one full lap is
    // reduced modulo total_duration up front, so the stepping loop below
    // never walks more than a single lap even for huge `now` jumps.
    if image.animation_state == AnimationState::Looping && passed_ms > image.total_duration {
        passed_ms %= image.total_duration;
    }

    loop {
        let gap = image
            .frame(image.current_frame)
            .map(|f| f.gap_ms as i64)
            .unwrap_or(0);
        if gap >= 0 && passed_ms < gap {
            break;
        }
        if image.current_frame >= last && image.animation_state == AnimationState::Loading {
            // Loading: no frame past the last uploaded one exists yet, so
            // freeze here rather than wrapping like a completed loop would.
            break;
        }
        let consumed = if gap < 0 { 0 } else { gap };
        passed_ms -= consumed;
        image.current_frame_time += consumed;
        image.current_frame = if image.current_frame >= last { 1 } else { image.current_frame + 1 };

        if image.animation_state == AnimationState::Looping
            && image.current_frame == start_frame
            && consumed == 0
        {
            // A full lap completed consuming zero time: every frame in the
            // cycle is gapless. Without this guard the loop would spin
            // forever re-entering frames whose gap never exceeds `passed_ms`.
            break;
        }
    }

    recompute_next_redraw(image, last);
}

fn recompute_next_redraw(image: &mut Image, last: u32) {
    let gap = image.frame(image.current_frame).map(|f| f.gap_ms as i64).unwrap_or(0);
    if gap < 0 {
        // Gapless frame: there's no deadline of its own: inherit the next
        // non-gapless frame's gap so the host still gets a redraw signal.
        let mut idx = image.current_frame;
        for _ in 0..last {
            idx = if idx >= last { 1 } else { idx + 1 };
            if let Some(f) = image.frame(idx) {
                if f.gap_ms >= 0 {
                    image.next_redraw = image.current_frame_time + f.gap_ms as i64;
                    return;
                }
            }
        }
        image.next_redraw = image.current_frame_time;
    } else {
        // §4.G: `next_redraw = current_frame_time + max(1 ms, gap)` — a
        // zero-gap ("default gap") frame would otherwise produce a deadline
        // at or before `now`, marking the row dirty every single cycle.
        image.next_redraw = image.current_frame_time + gap.max(1);
    }
}

impl crate::store::Store {
    /// Advance `image_id`'s animation state to `now`. A no-op if the image
    /// doesn't exist, mirroring the rest of the `Store` API's tolerance of
    /// stale ids.
    pub fn advance(&mut self, image_id: u32, now: Millis) {
        if let Some(image) = self.images.get_mut(&image_id) {
            advance_image(image, now);
        }
    }
}
