// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! DRM mode-setting display controller.
//!
//! The controller owns the display exclusively: it binds a connected
//! connector, an encoder and a CRTC once at startup, imports decoder
//! dma-bufs as planar YUV420 framebuffers through PRIME, and presents by
//! programming the CRTC with the framebuffer for the dequeued buffer.
//!
//! Importing never takes ownership of the dma-buf fd; the controller only
//! owns the GEM handle and framebuffer id it created, and releases exactly
//! those on teardown.

pub mod uapi;

use std::fs::File;
use std::os::fd::AsRawFd;
use std::time::Instant;

use drm_fourcc::DrmFourcc;
use nix::errno::Errno;
use thiserror::Error;
use zerocopy::FromZeros;

use crate::Fourcc;
use crate::Resolution;

/// Largest plausible frame edge; anything beyond this is a corrupt size.
const MAX_FRAME_DIM: u32 = 8192;

/// How many `/dev/dri/card*` nodes to probe for mode-setting support.
const MAX_CARDS: u32 = 4;

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("no DRM device with mode-setting support found")]
    NoDevice,
    #[error("no connected connector with modes found")]
    NoConnector,
    #[error("no usable encoder found")]
    NoEncoder,
    #[error("no usable CRTC found")]
    NoCrtc,
    #[error("cannot import buffer: {0}")]
    ImportFailed(String),
    #[error("cannot present frame: {0}")]
    PresentFailed(String),
    #[error("{0} failed: {1}")]
    Ioctl(&'static str, Errno),
}

/// Descriptor of one decoded frame handed to the display.
#[derive(Debug)]
pub struct FrameInfo {
    pub fd: i32,
    pub width: u32,
    pub height: u32,
    pub fourcc: Fourcc,
    pub bytes_used: u32,
    pub is_dmabuf: bool,
}

/// One imported dma-buf: the GEM handle and framebuffer created from it.
struct Framebuffer {
    dma_fd: i32,
    fb_id: u32,
    handle: u32,
}

struct ConnectorInfo {
    id: u32,
    current_encoder: u32,
    modes: Vec<uapi::drm_mode_modeinfo>,
}

struct CardResources {
    crtcs: Vec<u32>,
    connectors: Vec<u32>,
    encoders: Vec<u32>,
}

/// Computes the three-plane YUV420 layout for a contiguous buffer:
/// full-stride luma followed by the two half-stride chroma planes.
fn yuv420_layout(width: u32, height: u32) -> Result<([u32; 4], [u32; 4], [u32; 4]), DisplayError> {
    let luma_size = (width as u64) * (height as u64);
    if luma_size > u32::MAX as u64 {
        return Err(DisplayError::ImportFailed(format!(
            "luma plane of {}x{} overflows 32 bits",
            width, height
        )));
    }
    let luma_size = luma_size as u32;
    let chroma_size = luma_size / 4;

    let pitches = [width, width / 2, width / 2, 0];
    let offsets = [0, luma_size, luma_size + chroma_size, 0];
    Ok((pitches, offsets, [0; 4]))
}

pub struct DrmDisplay {
    file: File,
    connector_id: u32,
    crtc_id: u32,
    mode: uapi::drm_mode_modeinfo,
    framebuffers: Vec<Framebuffer>,
}

impl DrmDisplay {
    /// Opens the first card that enumerates mode-setting resources, then
    /// binds connector, mode, encoder and CRTC.
    pub fn open() -> Result<Self, DisplayError> {
        let (file, resources) = Self::open_card()?;

        let connector = Self::find_connector(&file, &resources)?;
        let mode = Self::pick_mode(&connector)?;
        log::info!(
            "display mode: {}x{}@{}Hz on connector {}",
            mode.hdisplay,
            mode.vdisplay,
            mode.vrefresh,
            connector.id
        );

        let encoder = Self::find_encoder(&file, &resources, &connector)?;
        let crtc_id = Self::find_crtc(&file, &resources, &encoder)?;

        Ok(Self {
            file,
            connector_id: connector.id,
            crtc_id,
            mode,
            framebuffers: Vec::new(),
        })
    }

    fn open_card() -> Result<(File, CardResources), DisplayError> {
        for card in 0..MAX_CARDS {
            let path = format!("/dev/dri/card{}", card);
            let file = match std::fs::OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => file,
                Err(e) => {
                    log::debug!("cannot open {}: {}", path, e);
                    continue;
                }
            };
            match Self::get_resources(&file) {
                Ok(resources) => {
                    log::info!(
                        "using DRM device {} ({} connectors, {} CRTCs)",
                        path,
                        resources.connectors.len(),
                        resources.crtcs.len()
                    );
                    return Ok((file, resources));
                }
                Err(e) => log::debug!("{} has no mode-setting support: {}", path, e),
            }
        }
        Err(DisplayError::NoDevice)
    }

    /// Standard two-call enumeration: probe the counts, allocate arrays,
    /// fetch. Retried once in case the counts grew in between.
    fn get_resources(file: &File) -> Result<CardResources, DisplayError> {
        for _ in 0..2 {
            let mut res = uapi::drm_mode_card_res::new_zeroed();
            // SAFETY: valid fd; all array pointers are zero so the kernel
            // only fills the counts.
            unsafe { uapi::drm_ioctl_mode_getresources(file.as_raw_fd(), &mut res) }
                .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETRESOURCES", e))?;

            let mut crtcs = vec![0u32; res.count_crtcs as usize];
            let mut connectors = vec![0u32; res.count_connectors as usize];
            let mut encoders = vec![0u32; res.count_encoders as usize];

            let mut fetch = uapi::drm_mode_card_res::new_zeroed();
            fetch.crtc_id_ptr = crtcs.as_mut_ptr() as usize as u64;
            fetch.count_crtcs = crtcs.len() as u32;
            fetch.connector_id_ptr = connectors.as_mut_ptr() as usize as u64;
            fetch.count_connectors = connectors.len() as u32;
            fetch.encoder_id_ptr = encoders.as_mut_ptr() as usize as u64;
            fetch.count_encoders = encoders.len() as u32;
            // SAFETY: valid fd; the id pointers reference arrays of the
            // advertised lengths, which outlive the call.
            unsafe { uapi::drm_ioctl_mode_getresources(file.as_raw_fd(), &mut fetch) }
                .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETRESOURCES", e))?;

            // A hotplug between the calls can grow the counts; go around.
            if fetch.count_crtcs as usize > crtcs.len()
                || fetch.count_connectors as usize > connectors.len()
                || fetch.count_encoders as usize > encoders.len()
            {
                continue;
            }
            crtcs.truncate(fetch.count_crtcs as usize);
            connectors.truncate(fetch.count_connectors as usize);
            encoders.truncate(fetch.count_encoders as usize);
            return Ok(CardResources { crtcs, connectors, encoders });
        }
        Err(DisplayError::NoDevice)
    }

    fn get_connector(file: &File, id: u32) -> Result<ConnectorInfo, DisplayError> {
        let mut probe = uapi::drm_mode_get_connector::new_zeroed();
        probe.connector_id = id;
        // SAFETY: valid fd; zero array pointers, the kernel fills counts.
        unsafe { uapi::drm_ioctl_mode_getconnector(file.as_raw_fd(), &mut probe) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETCONNECTOR", e))?;

        let mut modes =
            vec![uapi::drm_mode_modeinfo::new_zeroed(); probe.count_modes as usize];
        let mut fetch = uapi::drm_mode_get_connector::new_zeroed();
        fetch.connector_id = id;
        fetch.modes_ptr = modes.as_mut_ptr() as usize as u64;
        fetch.count_modes = modes.len() as u32;
        // SAFETY: valid fd; modes_ptr references an array of the advertised
        // length, which outlives the call.
        unsafe { uapi::drm_ioctl_mode_getconnector(file.as_raw_fd(), &mut fetch) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETCONNECTOR", e))?;
        modes.truncate(fetch.count_modes as usize);

        log::debug!(
            "connector {}: connection={}, {} modes",
            id,
            fetch.connection,
            modes.len()
        );
        if fetch.connection != uapi::DRM_MODE_CONNECTED || modes.is_empty() {
            return Err(DisplayError::NoConnector);
        }
        Ok(ConnectorInfo { id, current_encoder: fetch.encoder_id, modes })
    }

    fn find_connector(
        file: &File,
        resources: &CardResources,
    ) -> Result<ConnectorInfo, DisplayError> {
        for &id in &resources.connectors {
            if let Ok(connector) = Self::get_connector(file, id) {
                return Ok(connector);
            }
        }
        Err(DisplayError::NoConnector)
    }

    /// Prefers 1920x1080; falls back to the connector's first mode.
    fn pick_mode(connector: &ConnectorInfo) -> Result<uapi::drm_mode_modeinfo, DisplayError> {
        for mode in &connector.modes {
            log::debug!("  mode {}x{}@{}Hz", mode.hdisplay, mode.vdisplay, mode.vrefresh);
        }
        Ok(connector
            .modes
            .iter()
            .find(|m| m.hdisplay == 1920 && m.vdisplay == 1080)
            .or_else(|| connector.modes.first())
            .copied()
            .ok_or(DisplayError::NoConnector)?)
    }

    fn get_encoder(file: &File, id: u32) -> Result<uapi::drm_mode_get_encoder, DisplayError> {
        let mut encoder = uapi::drm_mode_get_encoder::new_zeroed();
        encoder.encoder_id = id;
        // SAFETY: valid fd, valid struct pointer.
        unsafe { uapi::drm_ioctl_mode_getencoder(file.as_raw_fd(), &mut encoder) }
            .map_err(|e| DisplayError::Ioctl("DRM_IOCTL_MODE_GETENCODER", e))?;
        Ok(encoder)
    }

    fn find_encoder(
        file: &File,
        resources: &CardResources,
        connector: &ConnectorInfo,
    ) -> Result<uapi::drm_mode_get_encoder, DisplayError> {
        if connector.current_encoder != 0 {
            if let Ok(encoder) = Self::get_encoder(file, connector.current_encoder) {
                return Ok(encoder);
            }
        }
        for &id in &resources.encoders {
            if let Ok(encoder) = Self::get_encoder(file, id) {
                return Ok(encoder);
            }
        }
        Err(DisplayError::NoEncoder)
    }

    fn find_crtc(
        file: &File,
        resources: &CardResources,
        encoder: &uapi::drm_mode_get_encoder,
    ) -> Result<u32, DisplayError> {
        let probe = |crtc_id: u32| -> bool {
            let mut crtc = uapi::drm_mode_crtc::new_zeroed();
            crtc.crtc_id = crtc_id;
            // SAFETY: valid fd, valid struct pointer, no array pointers set.
            unsafe { uapi::drm_ioctl_mode_getcrtc(file.as_raw_fd(), &mut crtc) }.is_ok()
        };

        if encoder.crtc_id != 0 && probe(encoder.crtc_id) {
            return Ok(encoder.crtc_id);
        }
        for (i, &crtc_id) in resources.crtcs.iter().enumerate() {
            if encoder.possible_crtcs & (1 << i) != 0 && probe(crtc_id) {
                return Ok(crtc_id);
            }
        }
        Err(DisplayError::NoCrtc)
    }

    /// Imports a decoder dma-buf as a YUV420 framebuffer, keyed by fd.
    /// Re-importing an already-cached fd is a cheap success. The fd itself
    /// stays owned by the caller.
    pub fn import_buffer(&mut self, fd: i32, width: u32, height: u32) -> Result<(), DisplayError> {
        if fd < 0 {
            return Err(DisplayError::ImportFailed(format!("invalid dma-buf fd {}", fd)));
        }
        if width == 0 || height == 0 || width > MAX_FRAME_DIM || height > MAX_FRAME_DIM {
            return Err(DisplayError::ImportFailed(format!(
                "implausible frame size {}x{}",
                width, height
            )));
        }
        if self.framebuffers.iter().any(|fb| fb.dma_fd == fd) {
            return Ok(());
        }

        let mut prime = uapi::drm_prime_handle::new_zeroed();
        prime.fd = fd;
        // SAFETY: valid fds on both sides, valid struct pointer.
        unsafe { uapi::drm_ioctl_prime_fd_to_handle(self.file.as_raw_fd(), &mut prime) }
            .map_err(|e| {
                DisplayError::ImportFailed(format!("PRIME import of fd {} failed: {}", fd, e))
            })?;
        let handle = prime.handle;

        let (pitches, offsets, modifier) = match yuv420_layout(width, height) {
            Ok(layout) => layout,
            Err(e) => {
                self.close_handle(handle);
                return Err(e);
            }
        };

        let mut fb = uapi::drm_mode_fb_cmd2::new_zeroed();
        fb.width = width;
        fb.height = height;
        fb.pixel_format = DrmFourcc::Yuv420 as u32;
        fb.handles = [handle, handle, handle, 0];
        fb.pitches = pitches;
        fb.offsets = offsets;
        fb.modifier = modifier.map(|m| m as u64);
        // SAFETY: valid fd, valid struct pointer.
        if let Err(e) = unsafe { uapi::drm_ioctl_mode_addfb2(self.file.as_raw_fd(), &mut fb) } {
            self.close_handle(handle);
            return Err(DisplayError::ImportFailed(format!(
                "YUV420 framebuffer creation failed: {}",
                e
            )));
        }

        log::info!(
            "imported dma-buf fd {} as framebuffer {} (handle {})",
            fd,
            fb.fb_id,
            handle
        );
        self.framebuffers.push(Framebuffer { dma_fd: fd, fb_id: fb.fb_id, handle });
        Ok(())
    }

    /// Scans out the framebuffer previously imported for `frame.fd`.
    pub fn present(&mut self, frame: &FrameInfo) -> Result<(), DisplayError> {
        if !frame.is_dmabuf || frame.fd < 0 {
            return Err(DisplayError::PresentFailed(
                "display requires dma-buf frames".to_string(),
            ));
        }
        let fb_id = self
            .framebuffers
            .iter()
            .find(|fb| fb.dma_fd == frame.fd)
            .map(|fb| fb.fb_id)
            .ok_or_else(|| {
                DisplayError::PresentFailed(format!("no framebuffer for fd {}", frame.fd))
            })?;

        let start = Instant::now();
        let connector_id = self.connector_id;
        let mut crtc = uapi::drm_mode_crtc::new_zeroed();
        crtc.set_connectors_ptr = &connector_id as *const u32 as usize as u64;
        crtc.count_connectors = 1;
        crtc.crtc_id = self.crtc_id;
        crtc.fb_id = fb_id;
        crtc.mode = self.mode;
        crtc.mode_valid = 1;
        // SAFETY: valid fd; the connector id the pointer references outlives
        // the call.
        unsafe { uapi::drm_ioctl_mode_setcrtc(self.file.as_raw_fd(), &mut crtc) }
            .map_err(|e| DisplayError::PresentFailed(format!("mode-set failed: {}", e)))?;

        log::debug!(
            "presented framebuffer {} in {} us",
            fb_id,
            start.elapsed().as_micros()
        );
        Ok(())
    }

    /// Removes every cached framebuffer and closes its GEM handle. The
    /// underlying dma-buf fds are untouched; their owners close them.
    pub fn release_framebuffers(&mut self) {
        for fb in self.framebuffers.drain(..) {
            let mut fb_id = fb.fb_id;
            // SAFETY: valid fd, fb_id came from ADDFB2 on this device.
            if let Err(e) = unsafe { uapi::drm_ioctl_mode_rmfb(self.file.as_raw_fd(), &mut fb_id) }
            {
                log::warn!("removing framebuffer {} failed: {}", fb.fb_id, e);
            }
            let mut close = uapi::drm_gem_close::new_zeroed();
            close.handle = fb.handle;
            // SAFETY: valid fd, handle came from PRIME import on this device.
            if let Err(e) = unsafe { uapi::drm_ioctl_gem_close(self.file.as_raw_fd(), &close) } {
                log::warn!("closing GEM handle {} failed: {}", fb.handle, e);
            }
        }
    }

    fn close_handle(&self, handle: u32) {
        let mut close = uapi::drm_gem_close::new_zeroed();
        close.handle = handle;
        // SAFETY: valid fd, handle came from PRIME import on this device.
        if let Err(e) = unsafe { uapi::drm_ioctl_gem_close(self.file.as_raw_fd(), &close) } {
            log::warn!("closing GEM handle {} failed: {}", handle, e);
        }
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn mode_size(&self) -> Resolution {
        Resolution { width: self.mode.hdisplay as u32, height: self.mode.vdisplay as u32 }
    }

    pub fn display_info(&self) -> String {
        format!(
            "DRM zero-copy: {}x{}@{}Hz",
            self.mode.hdisplay, self.mode.vdisplay, self.mode.vrefresh
        )
    }
}

impl Drop for DrmDisplay {
    fn drop(&mut self) {
        log::info!("releasing DRM resources");
        self.release_framebuffers();
        // The device fd closes with `file`, after everything derived from it.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv420_layout_for_1080p() {
        let (pitches, offsets, modifier) = yuv420_layout(1920, 1080).unwrap();
        assert_eq!(pitches, [1920, 960, 960, 0]);
        assert_eq!(offsets, [0, 2_073_600, 2_592_000, 0]);
        assert_eq!(modifier, [0; 4]);
    }

    #[test]
    fn yuv420_layout_rejects_plane_overflow() {
        assert!(matches!(
            yuv420_layout(70_000, 70_000),
            Err(DisplayError::ImportFailed(_))
        ));
    }

    #[test]
    fn odd_widths_halve_downward() {
        let (pitches, offsets, _) = yuv420_layout(854, 480).unwrap();
        assert_eq!(pitches[1], 427);
        assert_eq!(offsets[1], 854 * 480);
    }
}
