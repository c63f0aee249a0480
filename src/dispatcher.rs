//! Component I: executes a parsed [`Command`] against the [`Store`] and
//! produces the response string, if any, per §4.I / §6.2 / §7.
//!
//! Key-meaning disambiguation (which of several things `c=`, `r=`, `s=`,
//! `v=`, `x=`, `y=`, `z=`, `X=`, `Y=` mean) happens here rather than in
//! `parser.rs`: the parser hands over raw per-letter values, and each
//! branch below reads the letters relevant to its own action.

use std::io::{Read, Write};

use crate::error::CoreError;
use crate::model::{Blend, Compression, FrameFormat, Millis, ScaleMode, SrcRect};
use crate::parser::Command;
use crate::store::Store;
use crate::surface::{PlaceholderHost, Surface};

/// Dispatches one parsed command against `store`, returning the response
/// string to send (if any — quiet levels and intermediate-chunk suppression
/// can mean no response at all). `surface` is the same pixel-surface
/// capability used at draw time (§6.1) — a `delete` or re-upload command can
/// destroy placements with live pixmaps, and per §9 every destroyed pixmap
/// must return its handle to the surface.
pub fn dispatch_command(
    store: &mut Store,
    host: &mut impl PlaceholderHost,
    surface: &mut impl Surface,
    cmd: &Command,
    now: Millis,
) -> Option<String> {
    let quiet = cmd.get_or('q', 0);

    let outcome = match cmd.action {
        Some('q') => dispatch_query(store, surface, cmd, now),
        Some('f') => dispatch_frame_transmit(store, cmd, now),
        Some('p') => dispatch_put(store, host, surface, cmd, now),
        Some('T') => dispatch_transmit_and_display(store, host, surface, cmd, now),
        Some('d') => dispatch_delete(store, surface, cmd),
        Some('a') => dispatch_animate(store, cmd),
        Some('t') | None => dispatch_transmit(store, host, surface, cmd, now).0,
        Some(other) => {
            log::warn!("unrecognised action '{other}'");
            Outcome::Response(Err(CoreError::invalid(format!("unknown action '{other}'"))))
        }
    };

    build_response(cmd, quiet, outcome)
}

/// What a dispatch branch produced: either a terminal result that should be
/// reported (subject to quiet-level suppression), or nothing to report this
/// call (an in-progress chunked upload).
enum Outcome {
    Response(Result<(), CoreError>),
    Suppressed,
}

fn build_response(cmd: &Command, quiet: i64, outcome: Outcome) -> Option<String> {
    let result = match outcome {
        Outcome::Response(r) => r,
        Outcome::Suppressed => return None,
    };

    let identity = response_identity(cmd);
    match result {
        Ok(()) => {
            if quiet >= 1 {
                None
            } else {
                Some(format!("{identity};OK"))
            }
        }
        Err(err) => {
            if quiet >= 2 {
                None
            } else {
                Some(format!("{identity};{}", err.response_code()))
            }
        }
    }
}

/// `Gi=<id>[,I=<n>][,p=<pid>]`, identifying whichever of `{i,I,p}` the
/// client supplied (§6.2). Echoes the client-supplied `i=` value verbatim,
/// including a literal `0`; a client that wants the store-assigned id back
/// needs to query state explicitly rather than rely on `i=0` round-tripping
/// it through the response (every literal scenario in practice supplies an
/// explicit id).
fn response_identity(cmd: &Command) -> String {
    let mut parts = vec![format!("i={}", cmd.image_id)];
    if cmd.image_number != 0 {
        parts.push(format!("I={}", cmd.image_number));
    }
    if cmd.placement_id != 0 {
        parts.push(format!("p={}", cmd.placement_id));
    }
    format!("G{}", parts.join(","))
}

fn parse_format(cmd: &Command) -> FrameFormat {
    match cmd.get('f') {
        Some(24) => FrameFormat::Raw24,
        Some(32) => FrameFormat::Raw32,
        _ => FrameFormat::AutoWithDecoder,
    }
}

fn parse_compression(cmd: &Command) -> Compression {
    match cmd.get_char('o') {
        Some('z') => Compression::Zlib,
        _ => Compression::None,
    }
}

/// §4.I direct transmission (`t=d`, the default) and its `m=`-only
/// continuations. Shared by `t` (transmit) and `q` (query, which wraps this
/// and discards the image afterwards).
fn dispatch_transmit(
    store: &mut Store,
    host: &mut impl PlaceholderHost,
    surface: &mut impl Surface,
    cmd: &Command,
    now: Millis,
) -> (Outcome, u32) {
    // §4.I: "a command with m= and no a= continues a direct-upload in
    // progress" — continuation requires an upload actually in progress
    // (the target frame exists and is mid-upload), not merely a missing
    // `a=`. Otherwise the *first* chunk of a default-action (`a=` absent)
    // transmit — scenario 1's own form — is misread as a continuation of
    // an upload that was never started, and the image is never created.
    let in_progress = if cmd.action.is_none() && cmd.get('m').is_some() {
        let candidate_id = if cmd.image_id != 0 {
            Some(cmd.image_id)
        } else if cmd.image_number != 0 {
            store.find_by_number_id(cmd.image_number)
        } else {
            None
        };
        candidate_id.and_then(|id| {
            let frame_index = store.image(id)?.last_frame_index();
            let frame = store.get_frame(id, frame_index)?;
            (frame.status == crate::model::FrameStatus::Uploading).then_some((id, frame_index))
        })
    } else {
        None
    };
    let continuing = in_progress.is_some();

    let image_id = if let Some((id, _)) = in_progress {
        id
    } else {
        let id = store.new_image(cmd.image_id, now, surface);
        if cmd.image_number != 0 {
            if let Some(image) = store.image_mut(id) {
                image.image_number = Some(cmd.image_number);
            }
        }
        id
    };

    let frame_index = if let Some((_, idx)) = in_progress {
        idx
    } else {
        match store.append_frame(image_id, cmd.get_or('q', 0) as u8) {
            Ok(idx) => idx,
            Err(e) => return (Outcome::Response(Err(e)), image_id),
        }
    };

    // §4.H: `x=`/`y=`/`c=` are polysemous — "frame paste offset"/"background
    // frame" here, but "src rect origin"/"columns" for `p`/`T`. When this
    // transmit is the upload half of a `T` (transmit-and-display) command,
    // those three letters belong to the `put` half that follows, not to this
    // frame's own attributes, or scenario 3's `c=3,r=2` (meant as columns)
    // would be misread as a background-frame reference frame 1 can't have.
    let is_transmit_and_display = cmd.action == Some('T');

    if !continuing {
        if let Some(image) = store.image_mut(image_id) {
            if let Some(frame) = image.frame_mut(frame_index) {
                frame.format = parse_format(cmd);
                frame.compression = parse_compression(cmd);
                frame.data_pix_width = cmd.get_or('s', 0) as u32;
                frame.data_pix_height = cmd.get_or('v', 0) as u32;
                if !is_transmit_and_display {
                    frame.offset_x = cmd.get_or('x', 0) as i32;
                    frame.offset_y = cmd.get_or('y', 0) as i32;
                    frame.background_frame_index = cmd.get_or('c', 0) as u32;
                }
                frame.background_color = cmd.get_or('X', 0) as u32;
                frame.blend = if cmd.get_or('Y', 0) == 1 { Blend::Replace } else { Blend::Over };
                frame.gap_ms = cmd.get_or('z', 0) as i32;
                if let Some(size) = cmd.get('S') {
                    frame.expected_size = Some(size as u64);
                }
                frame.status = crate::model::FrameStatus::Uploading;
            }
        }
    }

    let more = cmd.get_or('m', 0) == 1;
    append_upload_chunk(store, image_id, frame_index, &cmd.payload, more);

    if more {
        return (Outcome::Suppressed, image_id);
    }

    let finish = finish_upload(store, image_id, frame_index);
    if finish.is_ok() {
        realize_pending_placeholders_if_first_frame(store, host, image_id, frame_index);
    }
    (Outcome::Response(finish.map(|_| ())), image_id)
}

/// Appends one base64-decoded chunk to a frame's cache file, enforcing the
/// per-file size limit as bytes arrive.
fn append_upload_chunk(store: &mut Store, image_id: u32, frame_index: u32, payload: &str, more: bool) {
    let bytes = crate::base64::decode(payload.as_bytes());
    let limit = store.limits.max_file_bytes;

    let current_size = store.get_frame(image_id, frame_index).map(|f| f.disk_size).unwrap_or(0);
    if current_size + bytes.len() as u64 > limit {
        store.cache_dir.remove_frame(image_id, frame_index);
        store.record_disk_size(image_id, frame_index, 0);
        if let Some(image) = store.image_mut(image_id) {
            if let Some(frame) = image.frame_mut(frame_index) {
                frame.uploading_failure = crate::model::UploadFailure::OverSizeLimit;
                frame.status = crate::model::FrameStatus::UploadError;
            }
        }
        return;
    }

    let write_result = (|| -> Result<(), CoreError> {
        let mut file = if current_size == 0 && !more {
            store.cache_dir.open_for_write(image_id, frame_index)?
        } else {
            std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(cache_file_path(store, image_id, frame_index))?
        };
        file.write_all(&bytes)?;
        Ok(())
    })();

    if write_result.is_err() {
        if let Some(image) = store.image_mut(image_id) {
            if let Some(frame) = image.frame_mut(frame_index) {
                frame.uploading_failure = crate::model::UploadFailure::CannotOpenCache;
                frame.status = crate::model::FrameStatus::UploadError;
            }
        }
        return;
    }

    store.record_disk_size(image_id, frame_index, current_size + bytes.len() as u64);
}

fn cache_file_path(store: &Store, image_id: u32, frame_index: u32) -> std::path::PathBuf {
    store.cache_dir.path().join(format!("img-{:03}-{:03}", image_id, frame_index))
}

/// Closes out a direct upload once `m=0` arrives: validates size, transitions
/// status, and triggers decode+compose.
fn finish_upload(store: &mut Store, image_id: u32, frame_index: u32) -> Result<(), CoreError> {
    let (expected, actual, already_failed) = {
        let frame = store
            .get_frame(image_id, frame_index)
            .ok_or_else(|| CoreError::not_found("no such frame"))?;
        (frame.expected_size, frame.disk_size, frame.status == crate::model::FrameStatus::UploadError)
    };

    if already_failed {
        return Err(CoreError::too_big("upload exceeded the per-file size limit"));
    }

    if let Some(expected) = expected {
        if expected != actual {
            if let Some(image) = store.image_mut(image_id) {
                if let Some(frame) = image.frame_mut(frame_index) {
                    frame.uploading_failure = crate::model::UploadFailure::UnexpectedSize;
                    frame.status = crate::model::FrameStatus::UploadError;
                }
            }
            return Err(CoreError::bad_file(format!("expected {expected} bytes, got {actual}")));
        }
    }

    if let Some(image) = store.image_mut(image_id) {
        if let Some(frame) = image.frame_mut(frame_index) {
            frame.status = crate::model::FrameStatus::UploadSuccess;
        }
        image.recompute_total_duration();
    }

    store.ensure_decoded(image_id, frame_index)
}

/// §4.I: once the first frame finishes uploading successfully, realize every
/// placement placeholder a `put` registered before any frame existed.
fn realize_pending_placeholders_if_first_frame(
    store: &mut Store,
    host: &mut impl PlaceholderHost,
    image_id: u32,
    frame_index: u32,
) {
    if frame_index != 1 {
        return;
    }
    let pending = match store.image_mut(image_id) {
        Some(image) => std::mem::take(&mut image.pending_placeholders),
        None => return,
    };
    for placement_id in pending {
        store.infer_size_if_needed(image_id, placement_id);
        if let Some(placement) = store.image(image_id).and_then(|i| i.placements.get(&placement_id)) {
            host.create_placeholder(image_id, placement_id, placement.cols, placement.rows);
        }
    }
}

/// §4.I file transmission (`t=f`|`t=t`).
fn dispatch_file_transmit(
    store: &mut Store,
    host: &mut impl PlaceholderHost,
    surface: &mut impl Surface,
    cmd: &Command,
    now: Millis,
) -> (Outcome, u32) {
    let path_bytes = crate::base64::decode(cmd.payload.as_bytes());
    let path = match String::from_utf8(path_bytes) {
        Ok(p) => p,
        Err(_) => return (Outcome::Response(Err(CoreError::invalid("file path is not valid UTF-8"))), 0),
    };

    let metadata = match std::fs::metadata(&path) {
        Ok(m) => m,
        Err(e) => return (Outcome::Response(Err(CoreError::bad_file(format!("cannot stat {path}: {e}")))), 0),
    };
    if !metadata.is_file() || metadata.len() == 0 {
        return (
            Outcome::Response(Err(CoreError::bad_file("source is not a non-empty regular file"))),
            0,
        );
    }
    if metadata.len() > store.limits.max_file_bytes {
        return (
            Outcome::Response(Err(CoreError::too_big("file exceeds the per-file size limit"))),
            0,
        );
    }

    let image_id = store.new_image(cmd.image_id, now, surface);
    if cmd.image_number != 0 {
        if let Some(image) = store.image_mut(image_id) {
            image.image_number = Some(cmd.image_number);
        }
    }
    let frame_index = match store.append_frame(image_id, cmd.get_or('q', 0) as u8) {
        Ok(idx) => idx,
        Err(e) => return (Outcome::Response(Err(e)), image_id),
    };

    if let Some(image) = store.image_mut(image_id) {
        if let Some(frame) = image.frame_mut(frame_index) {
            frame.format = parse_format(cmd);
            frame.compression = parse_compression(cmd);
            frame.data_pix_width = cmd.get_or('s', 0) as u32;
            frame.data_pix_height = cmd.get_or('v', 0) as u32;
        }
    }

    let copy_result = (|| -> Result<(), CoreError> {
        let mut src = std::fs::File::open(&path)?;
        let mut dst = store.cache_dir.open_for_write(image_id, frame_index)?;
        let mut buf = Vec::new();
        src.read_to_end(&mut buf)?;
        dst.write_all(&buf)?;
        Ok(())
    })();

    let Ok(()) = copy_result else {
        if let Some(image) = store.image_mut(image_id) {
            if let Some(frame) = image.frame_mut(frame_index) {
                frame.uploading_failure = crate::model::UploadFailure::CannotCopyFile;
                frame.status = crate::model::FrameStatus::UploadError;
            }
        }
        return (
            Outcome::Response(Err(CoreError::bad_file("failed to copy source file into cache"))),
            image_id,
        );
    };

    store.record_disk_size(image_id, frame_index, metadata.len());
    if let Some(image) = store.image_mut(image_id) {
        if let Some(frame) = image.frame_mut(frame_index) {
            frame.status = crate::model::FrameStatus::UploadSuccess;
        }
        image.recompute_total_duration();
    }

    let decode_result = store.ensure_decoded(image_id, frame_index);
    if decode_result.is_ok() {
        realize_pending_placeholders_if_first_frame(store, host, image_id, frame_index);
    }

    if cmd.get_char('t') == Some('t') && is_kitty_temp_file(&path) {
        let _ = std::fs::remove_file(&path);
    }

    (Outcome::Response(decode_result.map(|_| ())), image_id)
}

fn is_kitty_temp_file(path: &str) -> bool {
    let under_tmp = path.starts_with("/tmp/")
        || std::env::var("TMPDIR")
            .map(|dir| path.starts_with(&dir))
            .unwrap_or(false);
    under_tmp && path.contains("tty-graphics-protocol")
}

/// §4.I `q`: transmit through the normal path, then discard the image so it
/// never leaks into the store, reporting success/failure under the caller's
/// own id.
fn dispatch_query(store: &mut Store, surface: &mut impl Surface, cmd: &Command, now: Millis) -> Outcome {
    // A fresh scratch id keeps the real id namespace untouched even if the
    // caller's `i=` collides with something live.
    let mut scratch = cmd.clone();
    scratch.image_id = 0;
    scratch.action = None;

    struct NullHost;
    impl PlaceholderHost for NullHost {
        fn create_placeholder(&mut self, _image_id: u32, _placement_id: u32, _cols: u32, _rows: u32) {}
    }
    let mut host = NullHost;

    let (outcome, image_id) = if cmd.get_char('t') == Some('f') || cmd.get_char('t') == Some('t') {
        dispatch_file_transmit(store, &mut host, surface, &scratch, now)
    } else {
        dispatch_transmit(store, &mut host, surface, &scratch, now)
    };

    if image_id != 0 {
        store.delete_image(image_id, surface);
    }
    outcome
}

/// §4.I `f`: append a frame to an existing image.
fn dispatch_frame_transmit(store: &mut Store, cmd: &Command, now: Millis) -> Outcome {
    if !store.images.contains_key(&cmd.image_id) {
        return Outcome::Response(Err(CoreError::not_found(format!("no image with id {}", cmd.image_id))));
    }
    let frame_index = match store.append_frame(cmd.image_id, cmd.get_or('q', 0) as u8) {
        Ok(idx) => idx,
        Err(e) => return Outcome::Response(Err(e)),
    };

    if let Some(image) = store.image_mut(cmd.image_id) {
        if let Some(frame) = image.frame_mut(frame_index) {
            frame.format = parse_format(cmd);
            frame.compression = parse_compression(cmd);
            frame.data_pix_width = cmd.get_or('s', 0) as u32;
            frame.data_pix_height = cmd.get_or('v', 0) as u32;
            frame.offset_x = cmd.get_or('x', 0) as i32;
            frame.offset_y = cmd.get_or('y', 0) as i32;
            // `c=` means background frame for action `f` (§4.H table).
            frame.background_frame_index = cmd.get_or('c', 0) as u32;
            frame.background_color = cmd.get_or('X', 0) as u32;
            frame.blend = if cmd.get_or('Y', 0) == 1 { Blend::Replace } else { Blend::Over };
            frame.gap_ms = cmd.get_or('z', 0) as i32;
            frame.status = crate::model::FrameStatus::Uploading;
        }
    }

    let more = cmd.get_or('m', 0) == 1;
    append_upload_chunk(store, cmd.image_id, frame_index, &cmd.payload, more);
    if more {
        return Outcome::Suppressed;
    }

    let _ = now;
    Outcome::Response(finish_upload(store, cmd.image_id, frame_index).map(|_| ()))
}

/// §4.I `p`: create a placement. `c=`/`r=` mean columns/rows for this
/// action (§4.H table).
fn dispatch_put(
    store: &mut Store,
    host: &mut impl PlaceholderHost,
    surface: &mut impl Surface,
    cmd: &Command,
    now: Millis,
) -> Outcome {
    if !store.images.contains_key(&cmd.image_id) {
        return Outcome::Response(Err(CoreError::not_found(format!("no image with id {}", cmd.image_id))));
    }

    let cols = cmd.get_or('c', 0) as u32;
    let rows = cmd.get_or('r', 0) as u32;
    let virtual_placement = cmd.get_or('U', 0) == 1;

    let placement_id = match store.new_placement(cmd.image_id, cmd.placement_id, now, virtual_placement, cols, rows, surface) {
        Ok(id) => id,
        Err(e) => return Outcome::Response(Err(e)),
    };

    if let Some(image) = store.image_mut(cmd.image_id) {
        if let Some(placement) = image.placements.get_mut(&placement_id) {
            placement.src_rect = SrcRect {
                x: cmd.get_or('x', 0).max(0) as u32,
                y: cmd.get_or('y', 0).max(0) as u32,
                w: cmd.get_or('w', 0).max(0) as u32,
                h: cmd.get_or('h', 0).max(0) as u32,
            };
            placement.do_not_move_cursor = cmd.get_or('C', 0) == 1;
        }
    }

    let has_uploaded_frame = store.image(cmd.image_id).map(|i| i.last_uploaded_frame_index() > 0).unwrap_or(false);
    if !has_uploaded_frame {
        if let Some(image) = store.image_mut(cmd.image_id) {
            image.pending_placeholders.push(placement_id);
        }
        return Outcome::Response(Ok(()));
    }

    store.infer_size_if_needed(cmd.image_id, placement_id);
    if let Some(placement) = store.image(cmd.image_id).and_then(|i| i.placements.get(&placement_id)) {
        host.create_placeholder(cmd.image_id, placement_id, placement.cols, placement.rows);
    }
    Outcome::Response(Ok(()))
}

/// §4.I `T`: transmit then put, also recording `initial_placement_id`.
fn dispatch_transmit_and_display(
    store: &mut Store,
    host: &mut impl PlaceholderHost,
    surface: &mut impl Surface,
    cmd: &Command,
    now: Millis,
) -> Outcome {
    let transmit_outcome = if cmd.get_char('t') == Some('f') || cmd.get_char('t') == Some('t') {
        dispatch_file_transmit(store, host, surface, cmd, now).0
    } else {
        dispatch_transmit(store, host, surface, cmd, now).0
    };

    // A chunked upload (`more`) hasn't produced an image error yet, but the
    // placement still needs to exist so later chunks' placeholder-creation
    // on first-frame-success can find it; `dispatch_put` registers the
    // pending placeholder regardless of upload completion.
    let transmit_failed = matches!(&transmit_outcome, Outcome::Response(Err(_)));
    if transmit_failed {
        return transmit_outcome;
    }

    let mut put_cmd = cmd.clone();
    put_cmd.action = Some('p');
    let put_outcome = dispatch_put(store, host, surface, &put_cmd, now);

    if let Outcome::Response(Ok(())) = &put_outcome {
        if let Some(image) = store.image_mut(cmd.image_id) {
            if image.initial_placement_id == 0 {
                image.initial_placement_id = cmd.placement_id;
            }
        }
    }

    match transmit_outcome {
        Outcome::Suppressed => Outcome::Suppressed,
        other => match put_outcome {
            Outcome::Response(Err(e)) => Outcome::Response(Err(e)),
            _ => other,
        },
    }
}

/// §4.I `d`: delete placements and/or images. The specifier is `d=`'s
/// value; lowercase deletes placements only, uppercase also deletes the
/// image once no placements remain.
fn dispatch_delete(store: &mut Store, surface: &mut impl Surface, cmd: &Command) -> Outcome {
    let Some(specifier) = cmd.get_char('d') else {
        return delete_all_visible(store, surface, cmd.image_id, false);
    };

    let (target, also_image) = (specifier.to_ascii_lowercase(), specifier.is_ascii_uppercase());
    match target {
        'a' => delete_all_visible(store, surface, cmd.image_id, also_image),
        'i' => delete_by_image_id(store, surface, cmd.image_id, cmd.placement_id, also_image),
        'n' => delete_by_image_number(store, surface, cmd.image_number, also_image),
        _ => {
            log::warn!("unknown delete specifier '{specifier}', ignoring");
            Outcome::Response(Ok(()))
        }
    }
}

fn delete_all_visible(store: &mut Store, surface: &mut impl Surface, image_id: u32, also_image: bool) -> Outcome {
    if let Some(image) = store.image_mut(image_id) {
        let placement_ids: Vec<u32> = image.placements.keys().copied().collect();
        for pid in placement_ids {
            store.delete_placement(image_id, pid, surface);
        }
        if also_image {
            store.delete_image(image_id, surface);
        }
    }
    Outcome::Response(Ok(()))
}

fn delete_by_image_id(
    store: &mut Store,
    surface: &mut impl Surface,
    image_id: u32,
    placement_id: u32,
    also_image: bool,
) -> Outcome {
    if placement_id != 0 {
        store.delete_placement(image_id, placement_id, surface);
    } else {
        let placement_ids: Vec<u32> = store
            .image(image_id)
            .map(|i| i.placements.keys().copied().collect())
            .unwrap_or_default();
        for pid in placement_ids {
            store.delete_placement(image_id, pid, surface);
        }
    }
    if also_image {
        let empty = store.image(image_id).map(|i| i.placements.is_empty()).unwrap_or(false);
        if empty {
            store.delete_image(image_id, surface);
        }
    }
    Outcome::Response(Ok(()))
}

fn delete_by_image_number(store: &mut Store, surface: &mut impl Surface, number: u32, also_image: bool) -> Outcome {
    let Some(image_id) = store.find_by_number_id(number) else {
        return Outcome::Response(Ok(()));
    };
    delete_by_image_id(store, surface, image_id, 0, also_image)
}

/// §4.I `a`: animation control. `c=` means current frame, `s=` means state,
/// `r=`/`z=` may edit one frame's gap.
fn dispatch_animate(store: &mut Store, cmd: &Command) -> Outcome {
    let Some(image) = store.image_mut(cmd.image_id) else {
        return Outcome::Response(Err(CoreError::not_found(format!("no image with id {}", cmd.image_id))));
    };

    if let Some(frame_to_edit) = cmd.get('r') {
        if let Some(frame) = image.frame_mut(frame_to_edit as u32) {
            if let Some(gap) = cmd.get('z') {
                frame.gap_ms = gap as i32;
            }
        }
        image.recompute_total_duration();
    }

    if let Some(frame) = cmd.get('c') {
        image.current_frame = frame as u32;
    }

    if let Some(state) = cmd.get('s') {
        image.animation_state = match state {
            1 => crate::model::AnimationState::Stopped,
            2 => crate::model::AnimationState::Loading,
            3 => crate::model::AnimationState::Looping,
            _ => image.animation_state,
        };
    }
    if let Some(loops) = cmd.get('v') {
        image.loop_count = loops as u32;
    }

    Outcome::Response(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::store::{test_store, NullSurface};

    struct NullHost;
    impl PlaceholderHost for NullHost {
        fn create_placeholder(&mut self, _image_id: u32, _placement_id: u32, _cols: u32, _rows: u32) {}
    }

    fn direct_upload_header(image_id: u32, w: u32, h: u32, payload: &[u8]) -> String {
        format!(
            "Gi={image_id},f=32,s={w},v={h},a=T,m=0;{}",
            crate::base64::encode(payload)
        )
    }

    #[test]
    fn transmit_and_display_uploads_decodes_and_places() {
        let mut store = test_store();
        let mut host = NullHost;
        store.cell_w = 10;
        store.cell_h = 20;

        let payload = vec![0u8; 2 * 2 * 4];
        let header = direct_upload_header(1, 2, 2, &payload);
        let cmd = parse(&header);

        let response = dispatch_command(&mut store, &mut host, &mut NullSurface, &cmd, 0).unwrap();
        assert_eq!(response, "Gi=1;OK");

        let image = store.image(1).unwrap();
        assert_eq!(image.frames.len(), 1);
        assert_eq!(image.placements.len(), 1);
        assert!(matches!(
            image.frame(1).unwrap().status,
            crate::model::FrameStatus::RamLoadingSuccess
        ));
    }

    #[test]
    fn transmit_and_display_treats_c_and_r_as_columns_and_rows_not_frame_attrs() {
        // §8 scenario 3, reproduced literally: `c=3,r=2` on a `T` command must
        // be read by the `put` half as columns/rows, not by the transmit half
        // as a background-frame reference (frame 1 can't have one).
        struct RecordingHost {
            calls: Vec<(u32, u32, u32, u32)>,
        }
        impl PlaceholderHost for RecordingHost {
            fn create_placeholder(&mut self, image_id: u32, placement_id: u32, cols: u32, rows: u32) {
                self.calls.push((image_id, placement_id, cols, rows));
            }
        }

        let mut store = test_store();
        store.cell_w = 1;
        store.cell_h = 1;
        let mut host = RecordingHost { calls: Vec::new() };

        let payload = vec![0u8; 1 * 1 * 3];
        let header = format!(
            "Gi=7,p=9,a=T,f=24,s=1,v=1,c=3,r=2,t=d,m=0;{}",
            crate::base64::encode(&payload)
        );
        let cmd = parse(&header);

        let response = dispatch_command(&mut store, &mut host, &mut NullSurface, &cmd, 0).unwrap();
        assert_eq!(response, "Gi=7,p=9;OK");

        let image = store.image(7).unwrap();
        assert!(matches!(image.frame(1).unwrap().status, crate::model::FrameStatus::RamLoadingSuccess));
        assert_eq!(image.frame(1).unwrap().background_frame_index, 0);
        let placement = &image.placements[&9];
        assert_eq!((placement.cols, placement.rows), (3, 2));
        assert_eq!(host.calls, vec![(7, 9, 3, 2)]);
    }

    #[test]
    fn query_never_leaks_the_scratch_image() {
        let mut store = test_store();
        let payload = vec![0u8; 2 * 2 * 4];
        let header = format!(
            "Gi=9,f=32,s=2,v=2,a=q,m=0;{}",
            crate::base64::encode(&payload)
        );
        let cmd = parse(&header);

        let response = dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &cmd, 0).unwrap();
        assert_eq!(response, "Gi=9;OK");
        assert!(store.image(9).is_none());
        assert!(store.images.is_empty());
    }

    #[test]
    fn query_reports_failure_under_callers_id_without_leaking() {
        let mut store = test_store();
        // No `f=` means a container format, which the core never decodes
        // itself: `ensure_decoded` fails deterministically.
        let header = "Gi=9,a=q,m=0;AAAA".to_string();
        let cmd = parse(&header);

        let response = dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &cmd, 0).unwrap();
        assert!(response.starts_with("Gi=9;E"));
        assert!(store.images.is_empty());
    }

    #[test]
    fn put_defers_placeholder_until_first_frame_uploaded() {
        let mut store = test_store();
        store.cell_w = 10;
        store.cell_h = 20;
        let image_id = store.new_image(1, 0, &mut NullSurface);
        let cmd = parse(&format!("Gi={image_id},a=p,p=5,c=1,r=1"));

        let response = dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &cmd, 0).unwrap();
        assert_eq!(response, "Gi=1,p=5;OK");
        let image = store.image(image_id).unwrap();
        assert!(image.placements.contains_key(&5));
        assert_eq!(image.pending_placeholders, vec![5]);
    }

    #[test]
    fn delete_uppercase_specifier_also_removes_the_image() {
        let mut store = test_store();
        let image_id = store.new_image(1, 0, &mut NullSurface);
        store.new_placement(image_id, 0, 0, false, 1, 1, &mut NullSurface).unwrap();

        let cmd = parse(&format!("Gi={image_id},a=d,d=I"));
        let response = dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &cmd, 0).unwrap();
        assert_eq!(response, "Gi=1;OK");
        assert!(store.image(image_id).is_none());
    }

    #[test]
    fn delete_lowercase_specifier_keeps_the_image() {
        let mut store = test_store();
        let image_id = store.new_image(1, 0, &mut NullSurface);
        store.new_placement(image_id, 0, 0, false, 1, 1, &mut NullSurface).unwrap();

        let cmd = parse(&format!("Gi={image_id},a=d,d=i"));
        dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &cmd, 0);
        assert!(store.image(image_id).is_some());
        assert!(store.image(image_id).unwrap().placements.is_empty());
    }

    #[test]
    fn delete_frees_placement_pixmaps_on_the_surface() {
        struct FakeSurface {
            freed: Vec<crate::surface::PixmapHandle>,
            next_handle: u64,
        }
        impl Surface for FakeSurface {
            fn allocate_pixmap(&mut self, _w: u32, _h: u32) -> crate::surface::PixmapHandle {
                let h = self.next_handle;
                self.next_handle += 1;
                h
            }
            fn upload_rgba_premultiplied(
                &mut self,
                _pixmap: crate::surface::PixmapHandle,
                _bytes: &[u8],
                _w: u32,
                _h: u32,
            ) {
            }
            fn composite(
                &mut self,
                _src: crate::surface::PixmapHandle,
                _src_rect: crate::surface::PixelRect,
                _dst_rect: crate::surface::PixelRect,
                _op: crate::surface::CompositeOp,
            ) {
            }
            fn invert_copy(&mut self, _src: crate::surface::PixmapHandle, _w: u32, _h: u32) -> crate::surface::PixmapHandle {
                999
            }
            fn free_pixmap(&mut self, pixmap: crate::surface::PixmapHandle) {
                self.freed.push(pixmap);
            }
        }

        let mut store = test_store();
        let mut surface = FakeSurface { freed: Vec::new(), next_handle: 1 };
        let image_id = store.new_image(1, 0, &mut surface);
        let pid = store.new_placement(image_id, 0, 0, false, 1, 1, &mut surface).unwrap();
        store
            .image_mut(image_id)
            .unwrap()
            .placements
            .get_mut(&pid)
            .unwrap()
            .pixmaps
            .insert(1, crate::model::Pixmap { handle: 7, pix_width: 1, pix_height: 1 });
        store.ram_bytes += 4;

        let cmd = parse(&format!("Gi={image_id},a=d,d=I"));
        let response = dispatch_command(&mut store, &mut NullHost, &mut surface, &cmd, 0).unwrap();
        assert_eq!(response, "Gi=1;OK");
        assert!(surface.freed.contains(&7));
        assert_eq!(store.ram_bytes, 0);
    }

    #[test]
    fn animate_edits_state_and_frame_gap() {
        let mut store = test_store();
        let image_id = store.new_image(1, 0, &mut NullSurface);
        store.append_frame(image_id, 0).unwrap();
        store.append_frame(image_id, 0).unwrap();

        let cmd = parse(&format!("Gi={image_id},a=a,s=3,r=1,z=50"));
        let response = dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &cmd, 0).unwrap();
        assert_eq!(response, "Gi=1;OK");

        let image = store.image(image_id).unwrap();
        assert!(matches!(image.animation_state, crate::model::AnimationState::Looping));
        assert_eq!(image.frame(1).unwrap().gap_ms, 50);
    }

    #[test]
    fn quiet_level_one_suppresses_ok_but_not_errors() {
        let mut store = test_store();
        let cmd = parse("Gi=1,a=p,p=1,c=1,r=1,q=1");
        let response = dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &cmd, 0);
        assert_eq!(response, Some("Gi=1,p=1;ENOENT: no image with id 1".to_string()));
    }

    #[test]
    fn quiet_level_two_suppresses_everything() {
        let mut store = test_store();
        let cmd = parse("Gi=1,a=p,p=1,c=1,r=1,q=2");
        let response = dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &cmd, 0);
        assert_eq!(response, None);
    }

    #[test]
    fn unknown_action_is_reported_as_invalid() {
        let mut store = test_store();
        let cmd = parse("Gi=1,a=Z");
        let response = dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &cmd, 0).unwrap();
        assert!(response.starts_with("Gi=1;EINVAL"));
    }

    #[test]
    fn chunked_direct_upload_is_suppressed_until_final_chunk() {
        let mut store = test_store();
        store.cell_w = 10;
        store.cell_h = 20;
        let payload = vec![0u8; 2 * 2 * 4];
        let (first_half, second_half) = payload.split_at(payload.len() / 2);

        let first = parse(&format!(
            "Gi=1,f=32,s=2,v=2,a=t,m=1;{}",
            crate::base64::encode(first_half)
        ));
        assert_eq!(dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &first, 0), None);

        let second = parse(&format!(
            "Gi=1,m=0;{}",
            crate::base64::encode(second_half)
        ));
        let response = dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &second, 0).unwrap();
        assert_eq!(response, "Gi=1;OK");
        assert!(matches!(
            store.image(1).unwrap().frame(1).unwrap().status,
            crate::model::FrameStatus::RamLoadingSuccess
        ));
    }

    #[test]
    fn chunked_upload_with_no_action_on_first_chunk_still_creates_the_image() {
        // The first chunk of a default-action (`a=` absent, `t=d` implied)
        // direct upload also carries `m=1`; it must not be misread as a
        // continuation of some other upload already in progress.
        let mut store = test_store();
        store.cell_w = 10;
        store.cell_h = 20;
        let payload = vec![0u8; 2 * 2 * 3];
        let (first_half, second_half) = payload.split_at(payload.len() / 2);

        let first = parse(&format!(
            "Gi=1,f=24,s=2,v=2,t=d,m=1;{}",
            crate::base64::encode(first_half)
        ));
        assert_eq!(dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &first, 0), None);
        assert!(store.image(1).is_some());

        let second = parse(&format!("Gi=1,m=0;{}", crate::base64::encode(second_half)));
        let response = dispatch_command(&mut store, &mut NullHost, &mut NullSurface, &second, 0).unwrap();
        assert_eq!(response, "Gi=1;OK");
    }
}
