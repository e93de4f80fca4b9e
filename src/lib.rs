//! Atomic KMS resource manager
//!
//! Turns a Linux atomic mode-setting device into reusable pieces: buffer
//! objects with per-device handle de-duplication, dumb and imported
//! (dma-buf) framebuffers, framebuffer pools, typed property access, atomic
//! transactions and a coalescing commit queue driven by a poll scheduler.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Output paths (video, zero-copy decode, dma-buf)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               Pool::acquire / Fb::new_imported
//!               Atomic::plane_fb_set / Environment::queue
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        kms-atomic                           │
//! │  ┌───────────┐  ┌───────────┐  ┌─────────────────────────┐  │
//! │  │ BO table  │  │ FB / Pool │  │ Atomic + CommitQueue    │  │
//! │  │ (dedup)   │  │ (recycle) │  │ (next / cur / last)     │  │
//! │  └───────────┘  └───────────┘  └─────────────────────────┘  │
//! │            Environment (planes, CRTCs, connectors)          │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                               ▲
//!            KmsDevice ioctls             PollScheduler task
//!                 │                        (flip events)
//! ┌─────────────────────────────────────────────────────────────┐
//! │       /dev/dri/cardN (Card)   or   VirtualDevice            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use kms_atomic::{EnvConfig, Environment, PlaneTypes, Pool, PollQueue, Rect};
//! use kms_atomic::fourcc::DRM_FORMAT_XRGB8888;
//! use std::sync::Arc;
//!
//! let env = Environment::open("/dev/dri/card0", Arc::new(PollQueue::new()?), EnvConfig::default())?;
//! let (_conn, crtc) = env.first_output().unwrap();
//! let plane = env.claim_plane(&crtc, PlaneTypes::PRIMARY)?;
//! let pool = Pool::new(&env, 3);
//!
//! let fb = pool.acquire(crtc.width(), crtc.height(), DRM_FORMAT_XRGB8888)?;
//! fb.write().unwrap().fill(0x80);
//! let mut a = env.atomic();
//! a.plane_fb_set(&plane, Some(&fb), Rect::wh(crtc.width(), crtc.height()))?;
//! env.queue(a)?;
//! ```

pub mod atomic;
pub mod bo;
pub mod config;
pub mod device;
pub mod env;
pub mod error;
pub mod fb;
pub mod fourcc;
pub mod ioctl;
pub mod objects;
pub mod poll;
pub mod pool;
pub mod props;
pub mod queue;
pub mod rect;

pub use atomic::{Atomic, CommitFlags, PropRef, Rotation};
pub use bo::{BoKind, BufferObject};
pub use config::EnvConfig;
pub use env::Environment;
pub use error::Error;
pub use fb::{
    ColorInfo, DmaBufDescriptor, DmaBufLayer, DmaBufObject, DmaBufPlane, Fb, Framebuffer,
    HdrMetadata,
};
pub use objects::{ClaimedPlane, Connector, Crtc, Plane, PlaneType, PlaneTypes};
pub use poll::{ManualScheduler, PollQueue, PollScheduler, PollTask, Revents, TaskId};
pub use pool::Pool;
pub use props::{Blob, ObjectProps, PropEnum, PropRange};
pub use queue::QueueState;
pub use rect::Rect;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
