// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hand-declared DRM mode-setting ABI: resource enumeration, connector and
//! encoder discovery, PRIME import, framebuffer creation and CRTC
//! programming, for 64-bit Linux targets.
//!
//! See: include/uapi/drm/drm_mode.h

#![allow(non_camel_case_types)]

use nix::libc;
use zerocopy::FromZeros;

pub const DRM_MODE_CONNECTED: u32 = 1;

#[repr(C)]
#[derive(FromZeros)]
pub struct drm_mode_card_res {
    pub fb_id_ptr: u64,
    pub crtc_id_ptr: u64,
    pub connector_id_ptr: u64,
    pub encoder_id_ptr: u64,
    pub count_fbs: u32,
    pub count_crtcs: u32,
    pub count_connectors: u32,
    pub count_encoders: u32,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[repr(C)]
#[derive(Copy, Clone, FromZeros)]
pub struct drm_mode_modeinfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: [u8; 32],
}

#[repr(C)]
#[derive(FromZeros)]
pub struct drm_mode_get_connector {
    pub encoders_ptr: u64,
    pub modes_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_modes: u32,
    pub count_props: u32,
    pub count_encoders: u32,
    pub encoder_id: u32,
    pub connector_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(FromZeros)]
pub struct drm_mode_get_encoder {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[repr(C)]
#[derive(FromZeros)]
pub struct drm_mode_crtc {
    pub set_connectors_ptr: u64,
    pub count_connectors: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode_valid: u32,
    pub mode: drm_mode_modeinfo,
}

#[repr(C)]
#[derive(FromZeros)]
pub struct drm_prime_handle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

#[repr(C)]
#[derive(FromZeros)]
pub struct drm_mode_fb_cmd2 {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub flags: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: [u64; 4],
}

#[repr(C)]
#[derive(FromZeros)]
pub struct drm_gem_close {
    pub handle: u32,
    pub pad: u32,
}

const DRM_IOCTL_MAGIC: u8 = b'd';

nix::ioctl_write_ptr!(drm_ioctl_gem_close, DRM_IOCTL_MAGIC, 0x09, drm_gem_close);
nix::ioctl_readwrite!(drm_ioctl_prime_fd_to_handle, DRM_IOCTL_MAGIC, 0x2e, drm_prime_handle);
nix::ioctl_readwrite!(drm_ioctl_mode_getresources, DRM_IOCTL_MAGIC, 0xa0, drm_mode_card_res);
nix::ioctl_readwrite!(drm_ioctl_mode_getcrtc, DRM_IOCTL_MAGIC, 0xa1, drm_mode_crtc);
nix::ioctl_readwrite!(drm_ioctl_mode_setcrtc, DRM_IOCTL_MAGIC, 0xa2, drm_mode_crtc);
nix::ioctl_readwrite!(drm_ioctl_mode_getencoder, DRM_IOCTL_MAGIC, 0xa6, drm_mode_get_encoder);
nix::ioctl_readwrite!(
    drm_ioctl_mode_getconnector,
    DRM_IOCTL_MAGIC,
    0xa7,
    drm_mode_get_connector
);
nix::ioctl_readwrite!(drm_ioctl_mode_rmfb, DRM_IOCTL_MAGIC, 0xaf, libc::c_uint);
nix::ioctl_readwrite!(drm_ioctl_mode_addfb2, DRM_IOCTL_MAGIC, 0xb8, drm_mode_fb_cmd2);

#[cfg(test)]
#[cfg(target_pointer_width = "64")]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn abi_struct_sizes() {
        assert_eq!(size_of::<drm_mode_card_res>(), 64);
        assert_eq!(size_of::<drm_mode_modeinfo>(), 68);
        assert_eq!(size_of::<drm_mode_get_connector>(), 80);
        assert_eq!(size_of::<drm_mode_get_encoder>(), 20);
        assert_eq!(size_of::<drm_mode_crtc>(), 104);
        assert_eq!(size_of::<drm_prime_handle>(), 12);
        assert_eq!(size_of::<drm_mode_fb_cmd2>(), 104);
        assert_eq!(size_of::<drm_gem_close>(), 8);
    }
}
