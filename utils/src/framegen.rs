use swapr::BufferProperties;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NewFrameGeneratorError {
    #[error("Unsupported pixel format {0}")]
    UnsupportedFormat(swapr::PixelFormat),
}

#[derive(Debug, Error)]
pub enum GenerateFrameError {
    #[error("Provided buffer is too small")]
    BufferTooSmall,
}

/// Generates a moving test pattern into 32-bit RGB frames.
pub struct FrameGenerator {
    width: usize,
    height: usize,
    stride: usize,
    step: u32,
}

impl FrameGenerator {
    pub fn new(properties: &BufferProperties) -> Result<Self, NewFrameGeneratorError> {
        match properties.format.bytes_per_pixel() {
            Some(4) => (),
            _ => return Err(NewFrameGeneratorError::UnsupportedFormat(properties.format)),
        }

        Ok(FrameGenerator {
            width: properties.size.width as usize,
            height: properties.size.height as usize,
            stride: properties.size.width as usize * 4,
            step: 0,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.stride * self.height
    }

    /// Number of frames generated so far.
    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn next_frame<S: AsMut<[u8]>>(&mut self, frame: &mut S) -> Result<(), GenerateFrameError> {
        let frame = frame.as_mut();

        if frame.len() < self.frame_size() {
            return Err(GenerateFrameError::BufferTooSmall);
        }

        self.gen_pattern(frame);
        self.step = self.step.wrapping_add(1);

        Ok(())
    }

    fn gen_pattern(&mut self, frame: &mut [u8]) {
        frame
            .chunks_exact_mut(self.stride)
            .take(self.height)
            .map(|l| &mut l[0..self.width * 4])
            .enumerate()
            .for_each(|(y, line)| {
                line.chunks_exact_mut(4).enumerate().for_each(|(x, pixel)| {
                    let rgba = self.step.wrapping_add((x ^ y) as u32).to_le_bytes();
                    pixel[0] = rgba[0];
                    pixel[1] = rgba[1];
                    pixel[2] = rgba[2];
                    pixel[3] = 0xff;
                });
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swapr::{BufferUsage, PixelFormat, Size};

    #[test]
    fn test_frame_generator() {
        let properties = BufferProperties::new(
            Size::new(4, 2),
            PixelFormat::XRGB8888,
            BufferUsage::Software,
        );
        let mut generator = FrameGenerator::new(&properties).unwrap();
        assert_eq!(generator.frame_size(), 32);

        let mut small = vec![0u8; 16];
        assert!(matches!(
            generator.next_frame(&mut small),
            Err(GenerateFrameError::BufferTooSmall)
        ));

        let mut frame = vec![0u8; 32];
        generator.next_frame(&mut frame).unwrap();
        assert_eq!(generator.step(), 1);
        // Pixel (1, 0) of step 0.
        assert_eq!(&frame[4..8], &[1, 0, 0, 0xff]);

        generator.next_frame(&mut frame).unwrap();
        assert_eq!(&frame[4..8], &[2, 0, 0, 0xff]);
    }

    #[test]
    fn test_unsupported_format() {
        let properties = BufferProperties::new(
            Size::new(4, 2),
            PixelFormat::RGB565,
            BufferUsage::Software,
        );
        assert!(matches!(
            FrameGenerator::new(&properties),
            Err(NewFrameGeneratorError::UnsupportedFormat(_))
        ));
    }
}
