mod common;

use common::{dmabuf, raw, rig};
use kms_atomic::fb::MAX_FB_DIM;
use kms_atomic::fourcc::*;
use kms_atomic::{
    BoKind, BufferObject, DmaBufDescriptor, DmaBufLayer, DmaBufObject, DmaBufPlane, Error, Fb,
    Rect,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_concurrent_import_dedups() {
    let r = rig();
    let env = Arc::new(r.env);
    let buf = dmabuf(4096);
    // Two different fds for the same memory
    let fds = [raw(&buf), unsafe { libc::dup(raw(&buf)) }];
    assert!(fds[1] >= 0);

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = fds
        .iter()
        .map(|fd| {
            let (env, barrier, fd) = (env.clone(), barrier.clone(), *fd);
            thread::spawn(move || {
                barrier.wait();
                BufferObject::import(&env, fd).unwrap()
            })
        })
        .collect();
    let bos: Vec<BufferObject> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(bos[0].ptr_eq(&bos[1]));
    assert_eq!(bos[0].ref_count(), 2);
    assert_eq!(bos[0].kind(), BoKind::Imported);
    assert_eq!(env.imported_bo_count(), 1);
    assert_eq!(r.dev.stats().prime_imports, 1);

    drop(bos);
    assert_eq!(r.dev.stats().gem_closes, 1);
    assert_eq!(env.imported_bo_count(), 0);
    unsafe { libc::close(fds[1]) };
}

#[test]
fn test_import_bad_fd() {
    let r = rig();
    match BufferObject::import(&r.env, -1) {
        Err(Error::Import { fd, .. }) => assert_eq!(fd, -1),
        other => panic!("expected import error, got {:?}", other),
    }
}

#[test]
fn test_dumb_crop_round_trip_every_format() {
    let r = rig();
    for info in supported_formats() {
        let fb = Fb::new_dumb(&r.env, 333, 177, info.fourcc).unwrap();
        assert_eq!(fb.width(), 384);
        assert_eq!(fb.height(), 192);
        assert_eq!(fb.plane_count(), info.plane_count());
        assert_eq!(fb.active(), Rect::wh(333, 177));

        let crop = Rect::new(3, 5, 100, 50);
        fb.crop_set(crop).unwrap();
        assert_eq!(fb.crop_get(), crop, "{}", fourcc_string(info.fourcc));
        assert!(fb.crop_set(Rect::new(300, 0, 100, 10)).is_err());
    }
}

#[test]
fn test_dumb_pitches_follow_subsampling() {
    let r = rig();
    for info in supported_formats() {
        let mut last = 0;
        for width in [64, 200, 720, 1920] {
            let fb = Fb::new_dumb(&r.env, width, 64, info.fourcc).unwrap();
            let p0 = fb.pitch(0);
            assert!(p0 >= last, "{} pitch shrank", fourcc_string(info.fourcc));
            last = p0;
            match fb.plane_count() {
                1 => {}
                2 => assert_eq!(fb.pitch(1), p0),
                3 if info.wdiv(1) == 2 => {
                    assert_eq!(fb.pitch(1) * 2, p0);
                    assert_eq!(fb.pitch(2), fb.pitch(1));
                }
                3 => assert_eq!(fb.pitch(1), p0),
                n => panic!("{} planes", n),
            }
            for n in 1..fb.plane_count() {
                assert!(fb.offset(n) > fb.offset(n - 1));
            }
        }
    }
}

#[test]
fn test_dumb_nv12_layout() {
    let r = rig();
    let fb = Fb::new_dumb(&r.env, 1920, 1080, DRM_FORMAT_NV12).unwrap();
    assert_eq!(fb.height(), 1088);
    assert_eq!(fb.pitch(0), 1920);
    assert_eq!(fb.offset(1), 1920 * 1088);
    let bo = fb.plane_bo(1).unwrap();
    assert_eq!(bo.kind(), BoKind::Dumb);
    assert!(bo.size().unwrap() >= 1920 * 1088 * 3 / 2);

    let mut w = fb.write().unwrap();
    w.plane_mut(1).unwrap().fill(0x80);
    assert_eq!(w.plane_mut(1).unwrap().len(), 1920 * 544);
    drop(w);

    let id = fb.id();
    drop(fb);
    assert!(r.dev.fb(id).is_none());
    assert_eq!(r.dev.stats().dumb_destroys, 1);
}

#[test]
fn test_dumb_rejects_tiled_and_unknown() {
    let r = rig();
    assert!(matches!(
        Fb::new_dumb_mod(&r.env, 64, 64, DRM_FORMAT_NV12, DRM_FORMAT_MOD_BROADCOM_SAND128),
        Err(Error::FormatUnsupported { .. })
    ));
    assert!(matches!(
        Fb::new_dumb(&r.env, 64, 64, 0x2020_2020),
        Err(Error::FormatUnsupported { .. })
    ));
    assert_eq!(r.dev.stats().dumb_creates, 0);
}

fn nv12_desc(fds: [i32; 2], modifier: u64) -> DmaBufDescriptor {
    DmaBufDescriptor {
        width: 1920,
        height: 1080,
        objects: fds
            .iter()
            .map(|fd| DmaBufObject {
                fd: *fd,
                size: 1920 * 1088,
                modifier,
            })
            .collect(),
        layers: vec![DmaBufLayer {
            format: DRM_FORMAT_NV12,
            planes: vec![
                DmaBufPlane {
                    object_index: 0,
                    pitch: 1920,
                    offset: 0,
                },
                DmaBufPlane {
                    object_index: 1,
                    pitch: 1920,
                    offset: 0,
                },
            ],
        }],
    }
}

struct Owner(Arc<AtomicBool>);

impl Drop for Owner {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_import_two_object_nv12() {
    let r = rig();
    let (luma, chroma) = (dmabuf(1 << 21), dmabuf(1 << 20));
    let released = Arc::new(AtomicBool::new(false));

    let desc = nv12_desc([raw(&luma), raw(&chroma)], DRM_FORMAT_MOD_BROADCOM_SAND128);
    let owner = Box::new(Owner(released.clone()));
    let fb = Fb::new_imported(&r.env, &desc, Some(owner)).unwrap();

    assert_eq!(fb.format(), DRM_FORMAT_NV12);
    assert_eq!(fb.modifier(), DRM_FORMAT_MOD_BROADCOM_SAND128);
    assert_eq!(fb.bos().len(), 2);
    assert!(fb.plane_bo(0).unwrap().ptr_eq(&fb.bos()[0]));
    assert!(fb.plane_bo(1).unwrap().ptr_eq(&fb.bos()[1]));
    assert!(!fb.is_mapped());

    let req = r.dev.fb(fb.id()).unwrap();
    assert_eq!(req.modifiers, Some([DRM_FORMAT_MOD_BROADCOM_SAND128, DRM_FORMAT_MOD_BROADCOM_SAND128, 0, 0]));
    assert_ne!(req.handles[0], req.handles[1]);

    drop(fb);
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(r.dev.stats().gem_closes, 2);
    assert_eq!(r.dev.handle_count(), 0);
}

#[test]
fn test_import_one_object_backs_both_planes() {
    let r = rig();
    let buf = dmabuf(1 << 22);
    let mut desc = nv12_desc([raw(&buf), raw(&buf)], DRM_FORMAT_MOD_LINEAR);
    desc.objects.truncate(1);
    desc.layers[0].planes[1] = DmaBufPlane {
        object_index: 0,
        pitch: 1920,
        offset: 1920 * 1088,
    };

    let fb = Fb::new_imported(&r.env, &desc, None).unwrap();
    assert_eq!(fb.bos().len(), 1);
    assert!(fb.plane_bo(0).unwrap().ptr_eq(fb.plane_bo(1).unwrap()));
    assert_eq!(fb.offset(1), 1920 * 1088);
    drop(fb);
    assert_eq!(r.dev.stats().prime_imports, 1);
    assert_eq!(r.dev.stats().gem_closes, 1);
}

#[test]
fn test_import_failure_releases_bos() {
    let r = rig();
    let (a, b) = (dmabuf(4096), dmabuf(4096));
    // SAND128 is only accepted with NV12
    let mut desc = nv12_desc([raw(&a), raw(&b)], DRM_FORMAT_MOD_BROADCOM_SAND128);
    desc.layers[0].format = DRM_FORMAT_NV16;

    let e = Fb::new_imported(&r.env, &desc, None).unwrap_err();
    assert!(matches!(e, Error::FormatUnsupported { .. }), "{:?}", e);
    assert_eq!(r.dev.stats().prime_imports, 2);
    assert_eq!(r.dev.stats().gem_closes, 2);
    assert_eq!(r.env.imported_bo_count(), 0);

    desc.layers[0].planes[1].object_index = 5;
    assert!(matches!(
        Fb::new_imported(&r.env, &desc, None),
        Err(Error::InvalidValue(_))
    ));
}

#[test]
fn test_hdr_metadata_change_detection() {
    use kms_atomic::fb::HDMI_EOTF_SMPTE_ST2084;
    use kms_atomic::{ColorInfo, HdrMetadata};

    let r = rig();
    let fb = Fb::new_dumb(&r.env, 64, 64, DRM_FORMAT_NV12).unwrap();
    let md = HdrMetadata {
        eotf: HDMI_EOTF_SMPTE_ST2084,
        max_cll: 1000,
        ..Default::default()
    };
    let color = ColorInfo {
        encoding: Some(kms_atomic::props::names::COLOR_ENCODING_BT2020.to_string()),
        ..Default::default()
    };
    assert!(fb.color_metadata_set(color.clone(), Some(md)));
    assert!(!fb.color_metadata_set(color.clone(), Some(md)));
    assert!(fb.color_metadata_set(color, None));
    assert_eq!(fb.hdr_metadata(), None);
}

#[test]
fn test_import_same_buffer_twice_shares_bo() {
    let r = rig();
    let buf = dmabuf(1 << 22);
    let mut desc = nv12_desc([raw(&buf), raw(&buf)], DRM_FORMAT_MOD_LINEAR);
    desc.layers[0].planes[1].offset = 1920 * 1088;

    let fb = Fb::new_imported(&r.env, &desc, None).unwrap();
    assert_eq!(fb.bos().len(), 2);
    assert!(fb.bos()[0].ptr_eq(&fb.bos()[1]));
    assert_eq!(r.dev.stats().prime_imports, 1);
    assert_eq!(r.env.imported_bo_count(), 1);
    drop(fb);
    assert_eq!(r.dev.stats().gem_closes, 1);
}

#[test]
fn test_oversized_fb_rejected() {
    let r = rig();
    assert!(matches!(
        Fb::new_dumb(&r.env, MAX_FB_DIM + 1, 64, DRM_FORMAT_XRGB8888),
        Err(Error::InvalidValue(_))
    ));
    assert!(matches!(
        Fb::new_dumb(&r.env, 64, 0, DRM_FORMAT_XRGB8888),
        Err(Error::InvalidValue(_))
    ));

    let buf = dmabuf(4096);
    let mut desc = nv12_desc([raw(&buf), raw(&buf)], DRM_FORMAT_MOD_LINEAR);
    desc.height = 40000;
    assert!(matches!(
        Fb::new_imported(&r.env, &desc, None),
        Err(Error::InvalidValue(_))
    ));
    assert_eq!(r.dev.stats().dumb_creates, 0);
    assert_eq!(r.dev.stats().prime_imports, 0);
}

#[test]
fn test_crop_frac_set() {
    let r = rig();
    let fb = Fb::new_dumb(&r.env, 64, 64, DRM_FORMAT_XRGB8888).unwrap();
    let crop = Rect::new(0x8000, 0x4000, 32 << 16, 16 << 16);
    fb.crop_frac_set(crop).unwrap();
    assert_eq!(fb.crop_frac(), crop);
    assert_eq!(fb.src_rect(), crop);
    assert_eq!(fb.crop_get(), Rect::new(1, 0, 32, 16));

    for bad in [
        Rect::new(0, 0, (64 << 16) + 1, 1 << 16),
        Rect::new(-1, 0, 1 << 16, 1 << 16),
        Rect::new(63 << 16, 0, 2 << 16, 1 << 16),
        Rect::new(0, 0, 0, 1 << 16),
    ] {
        assert!(
            matches!(fb.crop_frac_set(bad), Err(Error::InvalidValue(_))),
            "{:?}",
            bad
        );
    }
    assert_eq!(fb.crop_frac(), crop);
}
