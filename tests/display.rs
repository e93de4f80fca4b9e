mod common;

use common::{dmabuf, raw, rig, rig_with, Rig};
use kms_atomic::fourcc::*;
use kms_atomic::ioctl::{DRM_MODE_OBJECT_CONNECTOR, DRM_MODE_OBJECT_CRTC, DRM_MODE_OBJECT_PLANE};
use kms_atomic::props::names;
use kms_atomic::{
    ClaimedPlane, ColorInfo, CommitFlags, DmaBufDescriptor, DmaBufLayer, DmaBufObject,
    DmaBufPlane, EnvConfig, Environment, Error, Fb, HdrMetadata, PlaneTypes, PollQueue, Pool,
    QueueState, Rect, Rotation,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn primary(r: &Rig) -> ClaimedPlane {
    let (_, crtc) = r.env.first_output().unwrap();
    r.env.claim_plane(&crtc, PlaneTypes::PRIMARY).unwrap()
}

fn plane_prop(r: &Rig, name: &str) -> u32 {
    r.dev.property_id(DRM_MODE_OBJECT_PLANE, name).unwrap()
}

#[test]
fn test_topology() {
    let r = rig();
    assert_eq!(r.env.crtcs().len(), 1);
    assert_eq!(r.env.connectors().len(), 1);
    assert_eq!(r.env.planes().len(), 4);

    let (conn, crtc) = r.env.first_output().unwrap();
    assert_eq!(conn.id(), r.dev.connector_id());
    assert_eq!(crtc.id(), r.dev.crtc_id());
    assert!(conn.is_connected());
    assert_eq!((crtc.width(), crtc.height()), (1920, 1080));
    assert_eq!(conn.preferred_mode().unwrap().hdisplay, 1920);
}

#[test]
fn test_claim_plane_busy() {
    let r = rig();
    let (_, crtc) = r.env.first_output().unwrap();
    let p = r.env.claim_plane(&crtc, PlaneTypes::PRIMARY).unwrap();
    assert_eq!(p.id(), r.dev.primary_plane_id());
    assert!(p.is_claimed());
    assert!(matches!(
        r.env.claim_plane(&crtc, PlaneTypes::PRIMARY),
        Err(Error::Busy(_))
    ));
    drop(p);
    assert!(r.env.claim_plane(&crtc, PlaneTypes::PRIMARY).is_ok());

    let o1 = r.env.claim_plane(&crtc, PlaneTypes::OVERLAY).unwrap();
    let o2 = r.env.claim_plane(&crtc, PlaneTypes::OVERLAY).unwrap();
    assert_ne!(o1.id(), o2.id());
    assert!(r.env.claim_plane(&crtc, PlaneTypes::OVERLAY).is_err());
    // Falls through to the cursor once the overlays are gone
    let any = r
        .env
        .claim_plane(&crtc, PlaneTypes::OVERLAY | PlaneTypes::CURSOR)
        .unwrap();
    assert_eq!(any.plane_type(), kms_atomic::PlaneType::Cursor);
}

#[test]
fn test_fb_replaced_before_submit_is_released() {
    let r = rig();
    let plane = primary(&r);
    let fb_prop = plane_prop(&r, "FB_ID");
    let first = Fb::new_dumb(&r.env, 64, 64, DRM_FORMAT_XRGB8888).unwrap();
    let second = Fb::new_dumb(&r.env, 64, 64, DRM_FORMAT_XRGB8888).unwrap();

    let mut a = r.env.atomic();
    a.add_fb(plane.id(), fb_prop, Some(&first));
    assert_eq!(first.ref_count(), 2);
    a.add_fb(plane.id(), fb_prop, Some(&second));
    assert_eq!(first.ref_count(), 1);
    assert_eq!(second.ref_count(), 2);

    r.env.queue(a).unwrap();
    let commits = r.dev.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(
        commits[0].value(plane.id(), fb_prop),
        Some(second.id() as u64)
    );
}

#[test]
fn test_plane_fb_set_geometry() {
    let r = rig();
    let plane = primary(&r);
    let fb = Fb::new_dumb(&r.env, 1280, 720, DRM_FORMAT_XRGB8888).unwrap();
    fb.crop_set(Rect::new(0, 60, 1280, 600)).unwrap();

    let mut a = r.env.atomic();
    a.plane_fb_set(&plane, Some(&fb), Rect::new(-10, 40, 1920, 900))
        .unwrap();
    let pid = plane.id();
    assert_eq!(a.value(pid, plane_prop(&r, "SRC_Y")), Some(60 << 16));
    assert_eq!(a.value(pid, plane_prop(&r, "SRC_W")), Some(1280 << 16));
    assert_eq!(a.value(pid, plane_prop(&r, "SRC_H")), Some(600 << 16));
    assert_eq!(a.value(pid, plane_prop(&r, "CRTC_X")), Some(-10i64 as u64));
    assert_eq!(a.value(pid, plane_prop(&r, "CRTC_W")), Some(1920));
    r.env.queue(a).unwrap();
    assert_eq!(
        r.dev.property_value(pid, "CRTC_ID"),
        Some(r.dev.crtc_id() as u64)
    );

    let nv12 = Fb::new_dumb(&r.env, 64, 64, DRM_FORMAT_NV12).unwrap();
    let mut b = r.env.atomic();
    assert!(matches!(
        b.plane_fb_set(&plane, Some(&nv12), Rect::wh(64, 64)),
        Err(Error::FormatUnsupported { .. })
    ));
}

#[test]
fn test_sand128_nv12_on_overlay_with_color() {
    let r = rig();
    let (_, crtc) = r.env.first_output().unwrap();
    let overlay = r.env.claim_plane(&crtc, PlaneTypes::OVERLAY).unwrap();
    let (luma, chroma) = (dmabuf(1 << 21), dmabuf(1 << 20));
    let desc = DmaBufDescriptor {
        width: 1920,
        height: 1080,
        objects: vec![
            DmaBufObject {
                fd: raw(&luma),
                size: 1 << 21,
                modifier: DRM_FORMAT_MOD_BROADCOM_SAND128,
            },
            DmaBufObject {
                fd: raw(&chroma),
                size: 1 << 20,
                modifier: DRM_FORMAT_MOD_BROADCOM_SAND128,
            },
        ],
        layers: vec![
            DmaBufLayer {
                format: DRM_FORMAT_R8,
                planes: vec![DmaBufPlane {
                    object_index: 0,
                    pitch: 1920,
                    offset: 0,
                }],
            },
            DmaBufLayer {
                format: DRM_FORMAT_GR88,
                planes: vec![DmaBufPlane {
                    object_index: 1,
                    pitch: 1920,
                    offset: 0,
                }],
            },
        ],
    };
    let fb = Fb::new_imported(&r.env, &desc, None).unwrap();
    assert_eq!(fb.format(), DRM_FORMAT_NV12);
    fb.color_metadata_set(
        ColorInfo {
            encoding: Some(names::COLOR_ENCODING_BT709.to_string()),
            range: Some(names::COLOR_RANGE_LIMITED.to_string()),
            colorspace: None,
        },
        None,
    );

    let mut a = r.env.atomic();
    a.plane_fb_set(&overlay, Some(&fb), Rect::wh(1920, 1080)).unwrap();
    a.plane_zpos(&overlay, 2).unwrap();
    r.env.queue(a).unwrap();

    assert_eq!(r.dev.property_value(overlay.id(), "FB_ID"), Some(fb.id() as u64));
    assert_eq!(r.dev.property_value(overlay.id(), "COLOR_ENCODING"), Some(1));
    assert_eq!(r.dev.property_value(overlay.id(), "COLOR_RANGE"), Some(0));
    assert_eq!(r.dev.property_value(overlay.id(), "zpos"), Some(2));
}

#[test]
fn test_queue_coalesces_while_in_flight() {
    let r = rig();
    let plane = primary(&r);
    let alpha = plane_prop(&r, "alpha");

    for n in 1..=5u16 {
        let mut a = r.env.atomic();
        a.plane_alpha(&plane, n * 0x1000).unwrap();
        r.env.queue(a).unwrap();
    }
    assert_eq!(r.env.queue_state(), QueueState::CommittedPending);
    assert_eq!(r.dev.commits().len(), 1);

    assert_eq!(r.vblank(), 1);
    assert_eq!(r.env.queue_state(), QueueState::Committed);
    r.vblank();
    assert_eq!(r.env.queue_state(), QueueState::Idle);

    let commits = r.dev.commits();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0].value(plane.id(), alpha), Some(0x1000));
    assert_eq!(commits[1].value(plane.id(), alpha), Some(0x5000));
}

#[test]
fn test_merged_commit_releases_displaced_fbs_once() {
    let r = rig();
    let plane = primary(&r);
    let fb_prop = plane_prop(&r, "FB_ID");
    let pool = Pool::new(&r.env, 4);
    let fbs: Vec<Fb> = (0..3)
        .map(|_| pool.acquire(640, 480, DRM_FORMAT_XRGB8888).unwrap())
        .collect();
    let ids: Vec<u32> = fbs.iter().map(|fb| fb.id()).collect();

    for fb in &fbs {
        let mut a = r.env.atomic();
        a.plane_fb_set(&plane, Some(fb), Rect::wh(640, 480)).unwrap();
        r.env.queue(a).unwrap();
    }
    // First in flight, third merged over the second
    let counts: Vec<usize> = fbs.iter().map(|fb| fb.ref_count()).collect();
    assert_eq!(counts, [2, 1, 2]);
    drop(fbs);
    assert_eq!(pool.free_count(), 1);

    r.vblank();
    assert_eq!(r.env.queue_state(), QueueState::Committed);
    assert_eq!(pool.free_count(), 1);
    r.vblank();
    assert_eq!(r.env.queue_state(), QueueState::Idle);
    // The first left the screen; the third is still on it
    assert_eq!(pool.free_count(), 2);
    assert_eq!(pool.live_count(), 3);

    let commits = r.dev.commits();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0].value(plane.id(), fb_prop), Some(ids[0] as u64));
    assert_eq!(commits[1].value(plane.id(), fb_prop), Some(ids[2] as u64));
    assert_eq!(r.dev.stats().dumb_destroys, 0);
    assert_eq!(r.dev.fb_count(), 3);
}

#[test]
fn test_commit_test_applies_nothing() {
    let r = rig();
    let plane = primary(&r);
    let mut a = r.env.atomic();
    a.plane_alpha(&plane, 0x2000).unwrap();

    a.commit_test(CommitFlags::empty()).unwrap();
    assert_eq!(r.dev.stats().test_commits, 1);
    assert!(r.dev.commits().is_empty());
    assert_eq!(r.dev.property_value(plane.id(), "alpha"), Some(0xffff));

    a.commit(CommitFlags::empty()).unwrap();
    assert_eq!(r.dev.stats().test_commits, 1);
    assert_eq!(r.dev.commits().len(), 1);
    assert_eq!(r.dev.property_value(plane.id(), "alpha"), Some(0x2000));

    // An empty transaction never reaches the device
    r.env.atomic().commit_test(CommitFlags::empty()).unwrap();
    assert_eq!(r.dev.stats().test_commits, 1);
}

#[test]
fn test_plane_rotation() {
    let r = rig();
    let plane = primary(&r);
    let rotation = plane_prop(&r, "rotation");
    let mut a = r.env.atomic();

    assert!(matches!(
        a.plane_rotation(&plane, Rotation::ROTATE_90),
        Err(Error::InvalidValue(_))
    ));
    assert_eq!(a.value(plane.id(), rotation), None);

    a.plane_rotation(&plane, Rotation::ROTATE_180 | Rotation::REFLECT_X)
        .unwrap();
    assert_eq!(a.value(plane.id(), rotation), Some(20));
    a.commit(CommitFlags::empty()).unwrap();
    assert_eq!(r.dev.property_value(plane.id(), "rotation"), Some(20));
}

#[test]
fn test_crtc_mode_blob_reused_while_unchanged() {
    let r = rig();
    let (_, crtc) = r.env.first_output().unwrap();
    let mode_id = r.dev.property_id(DRM_MODE_OBJECT_CRTC, "MODE_ID").unwrap();
    let mode = *crtc.mode().unwrap();
    let before = r.dev.stats().blobs_created;

    let mut a = r.env.atomic();
    a.crtc_mode_id_set(&crtc, Some(&mode)).unwrap();
    let mut b = r.env.atomic();
    b.crtc_mode_id_set(&crtc, Some(&mode)).unwrap();
    assert_eq!(r.dev.stats().blobs_created, before + 1);
    assert_eq!(a.value(crtc.id(), mode_id), b.value(crtc.id(), mode_id));

    a.commit(CommitFlags::ALLOW_MODESET).unwrap();
    assert_eq!(
        r.dev.property_value(crtc.id(), "MODE_ID"),
        a.value(crtc.id(), mode_id)
    );

    let slower = kms_atomic::ioctl::DrmModeModeinfo {
        vrefresh: 50,
        ..mode
    };
    let mut c = r.env.atomic();
    c.crtc_mode_id_set(&crtc, Some(&slower)).unwrap();
    assert_eq!(r.dev.stats().blobs_created, before + 2);
    assert_ne!(c.value(crtc.id(), mode_id), a.value(crtc.id(), mode_id));
    match c.commit(CommitFlags::empty()) {
        Err(e @ Error::CommitRejected { .. }) => assert_eq!(e.errno(), Some(libc::EINVAL)),
        other => panic!("modeset without ALLOW_MODESET: {:?}", other),
    }
    c.commit(CommitFlags::ALLOW_MODESET).unwrap();

    let mut d = r.env.atomic();
    d.crtc_mode_id_set(&crtc, None).unwrap();
    assert_eq!(d.value(crtc.id(), mode_id), Some(0));
}

#[test]
fn test_crtc_off_and_connector_detach() {
    let r = rig();
    let (conn, crtc) = r.env.first_output().unwrap();
    let mut a = r.env.atomic();
    a.crtc_active_set(&crtc, false).unwrap();
    a.conn_crtc_id_set(&conn, 0);

    assert!(matches!(
        a.commit_test(CommitFlags::empty()),
        Err(Error::CommitRejected { .. })
    ));
    a.commit_test(CommitFlags::ALLOW_MODESET).unwrap();
    assert_eq!(r.dev.property_value(crtc.id(), "ACTIVE"), Some(1));

    a.commit(CommitFlags::ALLOW_MODESET).unwrap();
    assert_eq!(r.dev.property_value(crtc.id(), "ACTIVE"), Some(0));
    assert_eq!(r.dev.property_value(conn.id(), "CRTC_ID"), Some(0));

    let mut b = r.env.atomic();
    b.crtc_active_set(&crtc, true).unwrap();
    b.conn_crtc_id_set(&conn, crtc.id());
    b.commit(CommitFlags::ALLOW_MODESET).unwrap();
    assert_eq!(r.dev.property_value(crtc.id(), "ACTIVE"), Some(1));
    assert_eq!(
        r.dev.property_value(conn.id(), "CRTC_ID"),
        Some(crtc.id() as u64)
    );
}

#[test]
fn test_connector_color_properties() {
    let r = rig();
    let (conn, _) = r.env.first_output().unwrap();
    let mut a = r.env.atomic();
    a.conn_colorspace_set(&conn, "BT2020_RGB").unwrap();
    a.conn_broadcast_rgb_set(&conn, "Full").unwrap();
    a.conn_max_bpc_set(&conn, 10).unwrap();
    a.commit(CommitFlags::empty()).unwrap();

    assert_eq!(r.dev.property_value(conn.id(), "Colorspace"), Some(9));
    assert_eq!(r.dev.property_value(conn.id(), "Broadcast RGB"), Some(1));
    assert_eq!(r.dev.property_value(conn.id(), "max bpc"), Some(10));

    let mut b = r.env.atomic();
    match b.conn_colorspace_set(&conn, "sRGB") {
        Err(Error::InvalidValue(msg)) => assert!(msg.contains("BT2020_YCC"), "{}", msg),
        other => panic!("expected unknown enum name, got {:?}", other),
    }
    assert!(matches!(
        b.conn_max_bpc_set(&conn, 16),
        Err(Error::InvalidValue(_))
    ));
    assert!(b.is_empty());
}

#[test]
fn test_plane_fb_set_blend_mode() {
    let r = rig();
    let plane = primary(&r);
    let blend = plane_prop(&r, "pixel blend mode");
    let fb = Fb::new_dumb(&r.env, 64, 64, DRM_FORMAT_ARGB8888).unwrap();

    let mut a = r.env.atomic();
    a.plane_fb_set(&plane, Some(&fb), Rect::wh(64, 64)).unwrap();
    assert_eq!(a.value(plane.id(), blend), None);

    fb.blend_mode_set(Some("Pre-multiplied"));
    assert_eq!(fb.blend_mode().as_deref(), Some("Pre-multiplied"));
    let mut b = r.env.atomic();
    b.plane_fb_set(&plane, Some(&fb), Rect::wh(64, 64)).unwrap();
    assert_eq!(b.value(plane.id(), blend), Some(1));
    r.env.queue(b).unwrap();
    assert_eq!(r.dev.property_value(plane.id(), "pixel blend mode"), Some(1));

    fb.blend_mode_set(Some("Multiply"));
    let mut c = r.env.atomic();
    assert!(matches!(
        c.plane_fb_set(&plane, Some(&fb), Rect::wh(64, 64)),
        Err(Error::InvalidValue(_))
    ));
}

#[test]
fn test_pool_of_three_on_primary() {
    let r = rig();
    let plane = primary(&r);
    let pool = Pool::new(&r.env, 3);

    let fb = pool.acquire(1920, 1080, DRM_FORMAT_XRGB8888).unwrap();
    fb.write().unwrap().fill(0x40);
    let mut a = r.env.atomic();
    a.plane_fb_set(&plane, Some(&fb), Rect::wh(1920, 1080)).unwrap();
    r.env.queue(a).unwrap();
    assert_eq!(r.env.queue_state(), QueueState::Committed);

    r.vblank();
    assert_eq!(r.env.queue_state(), QueueState::Idle);
    // Still on screen
    assert_eq!(fb.ref_count(), 2);
    let src_w = plane_prop(&r, "SRC_W");
    assert_eq!(r.dev.commits()[0].value(plane.id(), src_w), Some(1920 << 16));
    let first = fb.id();
    drop(fb);

    for _ in 0..10 {
        let fb = pool.acquire(1920, 1080, DRM_FORMAT_XRGB8888).unwrap();
        let mut a = r.env.atomic();
        a.plane_fb_set(&plane, Some(&fb), Rect::wh(1920, 1080)).unwrap();
        drop(fb);
        r.env.queue(a).unwrap();
        r.vblank();
        assert!(pool.live_count() <= 3);
    }
    assert!(r.dev.stats().dumb_creates <= 3);
    assert_eq!(r.dev.stats().dumb_destroys, 0);
    assert_eq!(r.dev.commits().len(), 11);
    assert!(r.dev.fb(first).is_some());
}

#[test]
fn test_busy_commit_is_retried() {
    let r = rig();
    let plane = primary(&r);
    r.dev.fail_next_commit(libc::EBUSY);

    let mut a = r.env.atomic();
    a.plane_alpha(&plane, 0x8000).unwrap();
    r.env.queue(a).unwrap();
    assert_eq!(r.env.queue_state(), QueueState::Committed);
    assert!(r.dev.commits().is_empty());
    assert_eq!(r.sched.pending_timers(), 1);

    assert_eq!(r.sched.run_timeouts(), 1);
    assert_eq!(r.dev.commits().len(), 1);
    assert_eq!(r.dev.property_value(plane.id(), "alpha"), Some(0x8000));
}

#[test]
fn test_busy_commit_dropped_after_retry_limit() {
    let r = rig_with(EnvConfig {
        commit_retry_limit: 1,
        ..EnvConfig::default()
    });
    let plane = primary(&r);
    r.dev.fail_next_commit(libc::EBUSY);
    r.dev.fail_next_commit(libc::EBUSY);

    let mut a = r.env.atomic();
    a.plane_alpha(&plane, 0x8000).unwrap();
    r.env.queue(a).unwrap();
    r.sched.run_timeouts();
    assert_eq!(r.env.queue_state(), QueueState::Idle);
    assert_eq!(r.sched.pending_timers(), 0);
    assert!(r.dev.commits().is_empty());
}

#[test]
fn test_rejected_commit_reports_errno() {
    let r = rig();
    let plane = primary(&r);
    let fb = Fb::new_dumb(&r.env, 64, 64, DRM_FORMAT_XRGB8888).unwrap();
    r.dev.fail_next_commit(libc::EINVAL);

    let mut a = r.env.atomic();
    a.plane_fb_set(&plane, Some(&fb), Rect::wh(64, 64)).unwrap();
    match r.env.queue(a) {
        Err(e @ Error::CommitRejected { .. }) => assert_eq!(e.errno(), Some(libc::EINVAL)),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(r.env.queue_state(), QueueState::Idle);
    assert_eq!(fb.ref_count(), 1);
}

#[test]
fn test_device_lost() {
    let r = rig();
    let plane = primary(&r);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    r.env.set_lost_handler(move |e| {
        assert!(matches!(e, Error::DeviceLost(_)));
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let pool = Pool::new(&r.env, 3);
    let fb = pool.acquire(640, 480, DRM_FORMAT_XRGB8888).unwrap();
    let mut a = r.env.atomic();
    a.plane_fb_set(&plane, Some(&fb), Rect::wh(640, 480)).unwrap();
    r.env.queue(a).unwrap();
    assert_eq!(fb.ref_count(), 2);

    r.dev.set_lost();
    assert_eq!(r.sched.run_ready(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(r.env.is_lost());
    assert!(pool.is_dead());
    assert_eq!(r.env.queue_state(), QueueState::Idle);
    assert_eq!(fb.ref_count(), 1);
    // The event task is not re-armed
    assert_eq!(r.sched.pending(), 0);

    assert!(matches!(r.env.queue(r.env.atomic()), Err(Error::DeviceLost(_))));
    assert!(matches!(r.env.dispatch_events(), Err(Error::DeviceLost(_))));
    assert!(pool.acquire(640, 480, DRM_FORMAT_XRGB8888).is_err());

    drop(fb);
    assert_eq!(r.dev.fb_count(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_restore_on_close() {
    let r = rig();
    let plane = primary(&r);
    let plane_id = plane.id();
    let fb = Fb::new_dumb(&r.env, 1920, 1080, DRM_FORMAT_XRGB8888).unwrap();

    let mut a = r.env.atomic();
    a.plane_fb_set(&plane, Some(&fb), Rect::wh(1920, 1080)).unwrap();
    a.plane_alpha(&plane, 0x1000).unwrap();
    r.env.queue(a).unwrap();
    r.vblank();
    assert_eq!(r.dev.property_value(plane_id, "FB_ID"), Some(fb.id() as u64));
    drop((fb, plane));

    let Rig { dev, env, .. } = r;
    drop(env);
    assert_eq!(dev.property_value(plane_id, "alpha"), Some(0xffff));
    assert_eq!(dev.property_value(plane_id, "FB_ID"), Some(0));
    assert_eq!(dev.fb_count(), 0);
    assert_eq!(dev.stats().dumb_destroys, 1);
}

#[test]
fn test_no_restore_when_disabled() {
    let r = rig_with(EnvConfig {
        restore_on_close: false,
        ..EnvConfig::default()
    });
    let plane = primary(&r);
    let plane_id = plane.id();
    let mut a = r.env.atomic();
    a.plane_alpha(&plane, 0x1000).unwrap();
    r.env.queue(a).unwrap();
    drop(plane);

    let Rig { dev, env, .. } = r;
    drop(env);
    assert_eq!(dev.property_value(plane_id, "alpha"), Some(0x1000));
}

#[test]
fn test_hdr_blob_reused_while_unchanged() {
    let r = rig();
    let (conn, _) = r.env.first_output().unwrap();
    let prop = r
        .dev
        .property_id(DRM_MODE_OBJECT_CONNECTOR, "HDR_OUTPUT_METADATA")
        .unwrap();
    let md = HdrMetadata {
        eotf: kms_atomic::fb::HDMI_EOTF_SMPTE_ST2084,
        max_cll: 1000,
        max_fall: 400,
        ..Default::default()
    };
    let before = r.dev.stats().blobs_created;

    let mut a = r.env.atomic();
    a.conn_hdr_metadata_set(&conn, Some(&md)).unwrap();
    let mut b = r.env.atomic();
    b.conn_hdr_metadata_set(&conn, Some(&md)).unwrap();
    assert_eq!(r.dev.stats().blobs_created, before + 1);
    assert_eq!(a.value(conn.id(), prop), b.value(conn.id(), prop));

    let brighter = HdrMetadata {
        max_cll: 4000,
        ..md
    };
    let mut c = r.env.atomic();
    c.conn_hdr_metadata_set(&conn, Some(&brighter)).unwrap();
    assert_eq!(r.dev.stats().blobs_created, before + 2);
    assert_ne!(c.value(conn.id(), prop), a.value(conn.id(), prop));

    let mut d = r.env.atomic();
    d.conn_hdr_metadata_set(&conn, None).unwrap();
    assert_eq!(d.value(conn.id(), prop), Some(0));
    drop((a, b, c, d));
    assert_eq!(r.dev.client_blob_count(), 0);
}

#[test]
fn test_poll_queue_drives_flips() {
    let dev = Arc::new(
        kms_atomic::device::VirtualDevice::new(kms_atomic::device::VirtualConfig::default())
            .unwrap(),
    );
    let sched = Arc::new(PollQueue::new().unwrap());
    let env = Environment::new(dev.clone(), sched, EnvConfig::default()).unwrap();
    let (_, crtc) = env.first_output().unwrap();
    let plane = env.claim_plane(&crtc, PlaneTypes::PRIMARY).unwrap();

    for n in 1..=2u16 {
        let mut a = env.atomic();
        a.plane_alpha(&plane, n * 0x100).unwrap();
        env.queue(a).unwrap();
    }
    assert_eq!(env.queue_state(), QueueState::CommittedPending);

    let vblank = {
        let dev = dev.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            dev.complete_flips();
        })
    };
    env.queue_wait().unwrap();
    vblank.join().unwrap();
    assert_eq!(dev.commits().len(), 2);

    dev.complete_flips();
    let start = Instant::now();
    while env.queue_state() != QueueState::Idle {
        assert!(start.elapsed() < Duration::from_secs(5), "flip never handled");
        thread::sleep(Duration::from_millis(2));
    }
}
