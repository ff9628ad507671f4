// SPDX-License-Identifier: GPL-3.0-only

//! Scanline rasterizer behind [`SoftwareGpu`](super::SoftwareGpu)
//!
//! Render targets are RGBA, rows top to bottom. Viewports use the GL
//! convention (origin bottom-left), so NDC `y = +1` lands on row 0.
//! Coverage is tested at pixel centres; textures are sampled nearest.

use super::Viewport;

/// A mutable RGBA render target
pub struct Target<'a> {
    pub pixels: &'a mut [u8],
    pub width: u32,
    pub height: u32,
}

/// A read-only RGBA texture
#[derive(Clone, Copy)]
pub struct TextureView<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl TextureView<'_> {
    /// Nearest sample at (`u`, `v`); `v = 1` is the first row
    fn sample(&self, u: f32, v: f32) -> [u8; 4] {
        if self.width == 0 || self.height == 0 {
            return [0, 0, 0, 255];
        }
        let col = ((u * self.width as f32) as i64).clamp(0, self.width as i64 - 1) as usize;
        let row = (((1.0 - v) * self.height as f32) as i64).clamp(0, self.height as i64 - 1) as usize;
        let idx = (row * self.width as usize + col) * 4;
        match self.pixels.get(idx..idx + 4) {
            Some(px) => [px[0], px[1], px[2], px[3]],
            None => [0, 0, 0, 255],
        }
    }
}

/// How fragments get their colour
pub enum Shade<'a> {
    Texture(TextureView<'a>),
    Color([u8; 4]),
    VertexColors(&'a [[u8; 4]]),
}

impl Target<'_> {
    fn put(&mut self, col: i64, row: i64, rgba: [u8; 4]) {
        if col < 0 || row < 0 || col >= self.width as i64 || row >= self.height as i64 {
            return;
        }
        let idx = (row as usize * self.width as usize + col as usize) * 4;
        if let Some(px) = self.pixels.get_mut(idx..idx + 4) {
            px.copy_from_slice(&rgba);
        }
    }
}

/// Fill the whole target with one colour
pub fn clear(target: &mut Target<'_>, rgba: [u8; 4]) {
    for px in target.pixels.chunks_exact_mut(4) {
        px.copy_from_slice(&rgba);
    }
}

/// Pixel-space rectangle of `viewport` clipped to the target, as rows
fn viewport_rows(target: &Target<'_>, viewport: &Viewport) -> Option<(i64, i64, i64, i64)> {
    let h = target.height as i64;
    let x0 = (viewport.x as i64).max(0);
    let x1 = (viewport.x as i64 + viewport.width as i64).min(target.width as i64);
    // Viewport y counts from the bottom edge
    let row0 = (h - (viewport.y as i64 + viewport.height as i64)).max(0);
    let row1 = (h - viewport.y as i64).min(h);
    if x0 >= x1 || row0 >= row1 {
        None
    } else {
        Some((x0, x1, row0, row1))
    }
}

/// NDC coordinates of the centre of pixel (`col`, `row`)
fn pixel_to_ndc(target_height: u32, viewport: &Viewport, col: i64, row: i64) -> (f32, f32) {
    let x = col as f32 + 0.5;
    let y_up = target_height as f32 - row as f32 - 0.5;
    (
        (x - viewport.x as f32) / viewport.width as f32 * 2.0 - 1.0,
        (y_up - viewport.y as f32) / viewport.height as f32 * 2.0 - 1.0,
    )
}

/// Window pixel holding NDC point `p`
fn ndc_to_pixel(target_height: u32, viewport: &Viewport, p: [f32; 2]) -> (i64, i64) {
    let x = viewport.x as f32 + (p[0] + 1.0) * 0.5 * viewport.width as f32;
    let y_up = viewport.y as f32 + (p[1] + 1.0) * 0.5 * viewport.height as f32;
    let max_x = viewport.x as i64 + viewport.width as i64 - 1;
    let max_y = viewport.y as i64 + viewport.height as i64 - 1;
    let col = (x.floor() as i64).clamp(viewport.x as i64, max_x.max(viewport.x as i64));
    let y = (y_up.floor() as i64).clamp(viewport.y as i64, max_y.max(viewport.y as i64));
    (col, target_height as i64 - 1 - y)
}

fn edge(a: [f32; 2], b: [f32; 2], p: (f32, f32)) -> f32 {
    (b[0] - a[0]) * (p.1 - a[1]) - (b[1] - a[1]) * (p.0 - a[0])
}

fn mix(a: [u8; 4], b: [u8; 4], t: f32) -> [u8; 4] {
    let mut out = [0u8; 4];
    for i in 0..4 {
        out[i] = (a[i] as f32 + (b[i] as f32 - a[i] as f32) * t).round() as u8;
    }
    out
}

/// Rasterize a triangle list.
///
/// Returns the number of fragments written.
pub fn fill_triangles(
    target: &mut Target<'_>,
    viewport: &Viewport,
    vertices: &[[f32; 2]],
    shade: &Shade<'_>,
) -> usize {
    let Some((x0, x1, row0, row1)) = viewport_rows(target, viewport) else {
        return 0;
    };
    let height = target.height;
    let mut written = 0;

    for (tri_index, tri) in vertices.chunks_exact(3).enumerate() {
        let (a, b, c) = (tri[0], tri[1], tri[2]);
        let area = edge(a, b, (c[0], c[1]));
        if area == 0.0 {
            continue;
        }

        for row in row0..row1 {
            for col in x0..x1 {
                let p = pixel_to_ndc(height, viewport, col, row);
                let w0 = edge(b, c, p) / area;
                let w1 = edge(c, a, p) / area;
                let w2 = edge(a, b, p) / area;
                if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                    continue;
                }

                let rgba = match shade {
                    Shade::Texture(tex) => tex.sample((p.0 + 1.0) * 0.5, (p.1 + 1.0) * 0.5),
                    Shade::Color(rgba) => *rgba,
                    Shade::VertexColors(colors) => {
                        let base = tri_index * 3;
                        let pick = |i: usize| colors.get(base + i).copied().unwrap_or([0, 0, 0, 255]);
                        let (ca, cb, cc) = (pick(0), pick(1), pick(2));
                        let mut out = [0u8; 4];
                        for i in 0..4 {
                            out[i] = (ca[i] as f32 * w0 + cb[i] as f32 * w1 + cc[i] as f32 * w2)
                                .round()
                                .clamp(0.0, 255.0) as u8;
                        }
                        out
                    }
                };
                target.put(col, row, rgba);
                written += 1;
            }
        }
    }

    written
}

/// Draw a closed polyline through `vertices`.
///
/// Returns the number of fragments written.
pub fn draw_line_loop(
    target: &mut Target<'_>,
    viewport: &Viewport,
    vertices: &[[f32; 2]],
    shade: &Shade<'_>,
) -> usize {
    if vertices.len() < 2 || viewport_rows(target, viewport).is_none() {
        return 0;
    }
    let height = target.height;
    let mut written = 0;

    for i in 0..vertices.len() {
        let j = (i + 1) % vertices.len();
        let start = ndc_to_pixel(height, viewport, vertices[i]);
        let end = ndc_to_pixel(height, viewport, vertices[j]);
        let (color_a, color_b) = match shade {
            Shade::Color(rgba) => (*rgba, *rgba),
            Shade::VertexColors(colors) => (
                colors.get(i).copied().unwrap_or([0, 0, 0, 255]),
                colors.get(j).copied().unwrap_or([0, 0, 0, 255]),
            ),
            // Lines never sample textures in the preview scenes
            Shade::Texture(_) => ([255, 255, 255, 255], [255, 255, 255, 255]),
        };

        let steps = (end.0 - start.0).abs().max((end.1 - start.1).abs());
        for step in 0..=steps {
            let t = if steps == 0 { 0.0 } else { step as f32 / steps as f32 };
            let col = start.0 + ((end.0 - start.0) as f32 * t).round() as i64;
            let row = start.1 + ((end.1 - start.1) as f32 * t).round() as i64;
            target.put(col, row, mix(color_a, color_b, t));
            written += 1;
        }
    }

    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaders::QUAD_VERTICES;

    const RED: [u8; 4] = [255, 0, 0, 255];
    const BLACK: [u8; 4] = [0, 0, 0, 255];

    fn pixel(pixels: &[u8], width: u32, col: u32, row: u32) -> [u8; 4] {
        let idx = ((row * width + col) * 4) as usize;
        [pixels[idx], pixels[idx + 1], pixels[idx + 2], pixels[idx + 3]]
    }

    #[test]
    fn test_quad_copies_texture_upright() {
        // 2x2 texture: row 0 red/green, row 1 blue/white
        let tex_pixels = [
            255, 0, 0, 255, 0, 255, 0, 255, //
            0, 0, 255, 255, 255, 255, 255, 255,
        ];
        let texture = TextureView {
            pixels: &tex_pixels,
            width: 2,
            height: 2,
        };
        let mut pixels = vec![0u8; 2 * 2 * 4];
        let mut target = Target {
            pixels: &mut pixels,
            width: 2,
            height: 2,
        };
        let written = fill_triangles(
            &mut target,
            &Viewport::new(0, 0, 2, 2),
            &QUAD_VERTICES,
            &Shade::Texture(texture),
        );
        assert!(written >= 4);
        assert_eq!(pixels, tex_pixels.to_vec());
    }

    #[test]
    fn test_viewport_limits_fill() {
        let mut pixels = vec![0u8; 4 * 4 * 4];
        let mut target = Target {
            pixels: &mut pixels,
            width: 4,
            height: 4,
        };
        clear(&mut target, BLACK);
        // Bottom-left quadrant in GL terms is the lower-left 2x2 block
        fill_triangles(
            &mut target,
            &Viewport::new(0, 0, 2, 2),
            &QUAD_VERTICES,
            &Shade::Color(RED),
        );
        assert_eq!(pixel(&pixels, 4, 0, 3), RED);
        assert_eq!(pixel(&pixels, 4, 1, 2), RED);
        assert_eq!(pixel(&pixels, 4, 0, 0), BLACK);
        assert_eq!(pixel(&pixels, 4, 3, 3), BLACK);
    }

    #[test]
    fn test_line_loop_outlines_rectangle() {
        let mut pixels = vec![0u8; 8 * 8 * 4];
        let mut target = Target {
            pixels: &mut pixels,
            width: 8,
            height: 8,
        };
        clear(&mut target, BLACK);
        // Outline spans columns 2..=6 and rows 1..=5
        let loop_vertices = [[-0.5, -0.5], [-0.5, 0.5], [0.5, 0.5], [0.5, -0.5]];
        draw_line_loop(
            &mut target,
            &Viewport::new(0, 0, 8, 8),
            &loop_vertices,
            &Shade::Color(RED),
        );
        assert_eq!(pixel(&pixels, 8, 2, 2), RED);
        assert_eq!(pixel(&pixels, 8, 6, 2), RED);
        assert_eq!(pixel(&pixels, 8, 2, 5), RED);
        assert_eq!(pixel(&pixels, 8, 4, 1), RED);
        assert_eq!(pixel(&pixels, 8, 4, 5), RED);
        // Interior untouched
        assert_eq!(pixel(&pixels, 8, 4, 4), BLACK);
    }

    #[test]
    fn test_degenerate_triangle_draws_nothing() {
        let mut pixels = vec![0u8; 4 * 4 * 4];
        let mut target = Target {
            pixels: &mut pixels,
            width: 4,
            height: 4,
        };
        let written = fill_triangles(
            &mut target,
            &Viewport::new(0, 0, 4, 4),
            &[[0.0, 0.0], [0.5, 0.5], [1.0, 1.0]],
            &Shade::Color(RED),
        );
        assert_eq!(written, 0);
    }
}
