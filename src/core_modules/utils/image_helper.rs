// THEORY:
// Training periodically writes one picture of what the generator currently does:
// a 2x5 grid, one row for the start of the last clip and one for its end. Frames
// live in `[-1, 1]`; they are mapped back to 8-bit intensities before tiling.
// Single-channel frames are shown as gray, three-channel frames as RGB.

pub mod image_helper {
    use crate::core_modules::frames::FrameVolume;
    use crate::error::{PipelineError, Result};
    use image::{ImageEncoder, Rgb, RgbImage};
    use std::path::Path;

    pub const GRID_PADDING: u32 = 2;

    /// Maps a normalized `[-1, 1]` value back to an 8-bit intensity.
    pub fn restore_pixel(value: f32) -> u8 {
        ((value + 1.0) * 127.5).round().clamp(0.0, 255.0) as u8
    }

    /// Renders frame `index` of `volume` as an RGB image.
    pub fn frame_to_rgb(volume: &FrameVolume, index: usize) -> Result<RgbImage> {
        let [channels, height, width] = volume.frame_shape();
        let frame = volume.frame(index).ok_or_else(|| {
            PipelineError::InvalidVolume(format!(
                "frame {} outside a volume of {} frames",
                index,
                volume.num_frames()
            ))
        })?;
        let plane = height * width;
        let channel_of = |c: usize| if channels >= 3 { c } else { 0 };

        let mut image = RgbImage::new(width as u32, height as u32);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let offset = y as usize * width + x as usize;
            *pixel = Rgb([
                restore_pixel(frame[channel_of(0) * plane + offset]),
                restore_pixel(frame[channel_of(1) * plane + offset]),
                restore_pixel(frame[channel_of(2) * plane + offset]),
            ]);
        }
        Ok(image)
    }

    /// Tiles equally sized images row by row on a black background.
    pub fn grid(rows: &[Vec<RgbImage>]) -> Result<RgbImage> {
        let Some(first) = rows.first().and_then(|row| row.first()) else {
            return Err(PipelineError::InvalidVolume("cannot tile an empty grid".to_string()));
        };
        let (tile_w, tile_h) = first.dimensions();
        let columns = rows.iter().map(Vec::len).max().unwrap_or(0) as u32;
        let width = columns * tile_w + (columns + 1) * GRID_PADDING;
        let height = rows.len() as u32 * tile_h + (rows.len() as u32 + 1) * GRID_PADDING;

        let mut canvas = RgbImage::new(width, height);
        for (row_index, row) in rows.iter().enumerate() {
            for (column_index, tile) in row.iter().enumerate() {
                if tile.dimensions() != (tile_w, tile_h) {
                    return Err(PipelineError::ShapeMismatch {
                        context: "visualization grid".to_string(),
                        expected: format!("{}x{}", tile_w, tile_h),
                        found: format!("{}x{}", tile.width(), tile.height()),
                    });
                }
                let left = GRID_PADDING + column_index as u32 * (tile_w + GRID_PADDING);
                let top = GRID_PADDING + row_index as u32 * (tile_h + GRID_PADDING);
                image::imageops::replace(&mut canvas, tile, left as i64, top as i64);
            }
        }
        Ok(canvas)
    }

    /// The 2x5 training sample grid.
    ///
    /// Row 0: first input frame, first reconstruction, second input frame, first
    /// short-term prediction, first long-term prediction. Row 1: the same picks at
    /// the end of the clip.
    pub fn sample_grid(
        clip: &FrameVolume,
        reconstruction: &FrameVolume,
        instant: &FrameVolume,
        longterm: &FrameVolume,
    ) -> Result<RgbImage> {
        let frames = clip.num_frames();
        let outputs = reconstruction.num_frames();
        if frames < 2
            || outputs == 0
            || instant.num_frames() != outputs
            || longterm.num_frames() != outputs
        {
            return Err(PipelineError::ShapeMismatch {
                context: "visualization sample".to_string(),
                expected: "a clip of at least 2 frames and equally long outputs".to_string(),
                found: format!(
                    "{} frames, outputs {}/{}/{}",
                    frames,
                    outputs,
                    instant.num_frames(),
                    longterm.num_frames()
                ),
            });
        }

        let first_row = vec![
            frame_to_rgb(clip, 0)?,
            frame_to_rgb(reconstruction, 0)?,
            frame_to_rgb(clip, 1)?,
            frame_to_rgb(instant, 0)?,
            frame_to_rgb(longterm, 0)?,
        ];
        let last_row = vec![
            frame_to_rgb(clip, frames - 2)?,
            frame_to_rgb(reconstruction, outputs - 1)?,
            frame_to_rgb(clip, frames - 1)?,
            frame_to_rgb(instant, outputs - 1)?,
            frame_to_rgb(longterm, outputs - 1)?,
        ];
        grid(&[first_row, last_row])
    }

    pub fn save(path: &Path, image: &RgbImage) -> Result<()> {
        let output = std::fs::File::create(path)?;
        let encoder = image::codecs::png::PngEncoder::new(output);

        encoder.write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgb8,
        )?;

        Ok(())
    }
}
