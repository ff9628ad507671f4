// SPDX-License-Identifier: GPL-3.0-only

//! Camera images bound to external textures
//!
//! One texture per [`ImagePlane`], each bound to the EGL image of the most
//! recent camera buffer. Replacing an image destroys the previous one first,
//! which drops the GPU's reference to the old buffer.

use crate::backends::camera::ClientBuffer;
use crate::gpu::{GpuDevice, GpuResult, ImageId, ImagePlane, TextureId, TextureTarget};
use tracing::trace;

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    texture: Option<TextureId>,
    image: Option<ImageId>,
}

/// External textures for the RGB, Y, U and V views of a camera buffer
#[derive(Debug, Default)]
pub struct TextureSet {
    slots: [Slot; 4],
}

fn slot_index(plane: ImagePlane) -> usize {
    match plane {
        ImagePlane::Rgb => 0,
        ImagePlane::Y => 1,
        ImagePlane::U => 2,
        ImagePlane::V => 3,
    }
}

impl TextureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the texture names for every plane
    pub fn create(&mut self, gpu: &mut dyn GpuDevice) -> GpuResult<()> {
        for slot in &mut self.slots {
            if slot.texture.is_none() {
                slot.texture = Some(gpu.gen_texture()?);
            }
        }
        Ok(())
    }

    pub fn texture(&self, plane: ImagePlane) -> Option<TextureId> {
        self.slots[slot_index(plane)].texture
    }

    pub fn image(&self, plane: ImagePlane) -> Option<ImageId> {
        self.slots[slot_index(plane)].image
    }

    /// At least one plane has an image to draw
    pub fn has_image(&self) -> bool {
        self.slots.iter().any(|slot| slot.image.is_some())
    }

    /// Point `plane`'s texture at `buffer`
    pub fn update(
        &mut self,
        gpu: &mut dyn GpuDevice,
        plane: ImagePlane,
        buffer: &ClientBuffer,
    ) -> GpuResult<()> {
        let slot = &mut self.slots[slot_index(plane)];
        let texture = match slot.texture {
            Some(texture) => texture,
            None => {
                let texture = gpu.gen_texture()?;
                slot.texture = Some(texture);
                texture
            }
        };

        if let Some(old) = slot.image.take() {
            gpu.destroy_image(old);
        }

        let image = gpu.create_external_image(buffer, plane)?;
        if let Err(e) = gpu.bind_image(texture, TextureTarget::External, image) {
            gpu.destroy_image(image);
            return Err(e);
        }
        slot.image = Some(image);
        trace!(plane = plane.name(), handle = buffer.handle(), "Texture updated");
        Ok(())
    }

    /// Destroy every image; textures stay allocated
    pub fn destroy_images(&mut self, gpu: &mut dyn GpuDevice) {
        for slot in &mut self.slots {
            if let Some(image) = slot.image.take() {
                gpu.destroy_image(image);
            }
        }
    }

    /// Destroy images and delete the textures
    pub fn delete(&mut self, gpu: &mut dyn GpuDevice) {
        self.destroy_images(gpu);
        for slot in &mut self.slots {
            if let Some(texture) = slot.texture.take() {
                gpu.delete_texture(texture);
            }
        }
    }
}
