// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hand-declared videodev2 ABI: the structs, constants and ioctl numbers the
//! decoder handle needs, for 64-bit Linux targets.
//!
//! See: https://docs.kernel.org/userspace-api/media/v4l/videodev.html

#![allow(non_camel_case_types)]

use nix::libc;
use zerocopy::FromZeros;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE: u32 = 10;

pub const V4L2_MEMORY_DMABUF: u32 = 4;

pub const V4L2_CAP_VIDEO_M2M_MPLANE: u32 = 0x0000_4000;

pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;
pub const V4L2_BUF_FLAG_LAST: u32 = 0x0010_0000;

pub const V4L2_EVENT_EOS: u32 = 2;
pub const V4L2_EVENT_FRAME_SYNC: u32 = 4;
pub const V4L2_EVENT_SOURCE_CHANGE: u32 = 5;
pub const V4L2_EVENT_SRC_CH_RESOLUTION: u32 = 0x0001;

pub const V4L2_CID_MIN_BUFFERS_FOR_CAPTURE: u32 = 0x0099_0900 + 227;

#[repr(C)]
#[derive(FromZeros)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, FromZeros)]
pub struct v4l2_plane_pix_format {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

#[repr(C)]
#[derive(Copy, Clone, FromZeros)]
pub struct v4l2_pix_format_mplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [v4l2_plane_pix_format; 8],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

/// The `fmt` union of `struct v4l2_format`. Only the multi-planar member is
/// declared; `raw` pads the union to its full 200 bytes and forces the
/// 8-byte alignment the C union gets from its pointer-bearing members.
#[repr(C)]
pub union v4l2_format_fmt {
    pub pix_mp: v4l2_pix_format_mplane,
    pub raw: [u64; 25],
}

#[repr(C)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_fmt,
}

#[repr(C)]
#[derive(FromZeros)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_plane_m {
    pub mem_offset: u32,
    pub userptr: libc::c_ulong,
    pub fd: i32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: v4l2_plane_m,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub planes: *mut v4l2_plane,
    pub fd: i32,
}

#[repr(C)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

#[repr(C)]
#[derive(FromZeros)]
pub struct v4l2_event_subscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

/// `struct v4l2_event`, with the payload union declared as raw bytes; the
/// source-change payload is a single leading `u32` of change flags.
#[repr(C)]
pub struct v4l2_event {
    pub type_: u32,
    pub u: [u8; 64],
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: libc::timespec,
    pub id: u32,
    pub reserved: [u32; 8],
}

impl v4l2_event {
    /// The `changes` field of a source-change event payload.
    pub fn src_change_flags(&self) -> u32 {
        u32::from_ne_bytes([self.u[0], self.u[1], self.u[2], self.u[3]])
    }
}

#[repr(C)]
#[derive(FromZeros)]
pub struct v4l2_control {
    pub id: u32,
    pub value: i32,
}

const VIDIOC_MAGIC: u8 = b'V';

nix::ioctl_read!(vidioc_querycap, VIDIOC_MAGIC, 0, v4l2_capability);
nix::ioctl_readwrite!(vidioc_g_fmt, VIDIOC_MAGIC, 4, v4l2_format);
nix::ioctl_readwrite!(vidioc_s_fmt, VIDIOC_MAGIC, 5, v4l2_format);
nix::ioctl_readwrite!(vidioc_reqbufs, VIDIOC_MAGIC, 8, v4l2_requestbuffers);
nix::ioctl_readwrite!(vidioc_qbuf, VIDIOC_MAGIC, 15, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_dqbuf, VIDIOC_MAGIC, 17, v4l2_buffer);
nix::ioctl_write_ptr!(vidioc_streamon, VIDIOC_MAGIC, 18, libc::c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, VIDIOC_MAGIC, 19, libc::c_int);
nix::ioctl_readwrite!(vidioc_s_ctrl, VIDIOC_MAGIC, 28, v4l2_control);
nix::ioctl_read!(vidioc_dqevent, VIDIOC_MAGIC, 89, v4l2_event);
nix::ioctl_write_ptr!(vidioc_subscribe_event, VIDIOC_MAGIC, 90, v4l2_event_subscription);

#[cfg(test)]
#[cfg(target_pointer_width = "64")]
mod tests {
    use std::mem::size_of;

    use super::*;

    // The kernel dispatches these ioctls on the struct size embedded in the
    // request number; a size mismatch is an EINVAL at runtime, so pin the
    // hand-declared layouts here.
    #[test]
    fn abi_struct_sizes() {
        assert_eq!(size_of::<v4l2_capability>(), 104);
        assert_eq!(size_of::<v4l2_plane_pix_format>(), 16);
        assert_eq!(size_of::<v4l2_pix_format_mplane>(), 160);
        assert_eq!(size_of::<v4l2_format>(), 208);
        assert_eq!(size_of::<v4l2_requestbuffers>(), 20);
        assert_eq!(size_of::<v4l2_plane>(), 64);
        assert_eq!(size_of::<v4l2_buffer>(), 88);
        assert_eq!(size_of::<v4l2_event_subscription>(), 32);
        assert_eq!(size_of::<v4l2_event>(), 136);
        assert_eq!(size_of::<v4l2_control>(), 8);
    }

    #[test]
    fn format_union_alignment() {
        // The C union contains pointer-bearing members, so `fmt` sits at
        // offset 8 on 64-bit.
        assert_eq!(std::mem::offset_of!(v4l2_format, fmt), 8);
    }
}
