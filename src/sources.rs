use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::classifier::{BoxType, CATALOG};
use crate::error::AcquisitionError;
use crate::frame::{Frame, FrameSource};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tif"];

/// Still images from disk: one file, or every image in a directory in name order.
/// A directory can be replayed; a single file is processed once.
pub struct ImageFileSource {
    paths: Vec<PathBuf>,
    index: usize,
    replayable: bool,
    open: bool,
}

impl ImageFileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let paths = if path.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("listing {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| is_image(p))
                .collect();
            paths.sort();
            paths
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            return Err(anyhow!("Image source {} does not exist", path.display()));
        };

        if paths.is_empty() {
            return Err(anyhow!("No images found in {}", path.display()));
        }
        info!("Image source ready: {} file(s) from {}", paths.len(), path.display());
        Ok(Self {
            paths,
            index: 0,
            replayable: path.is_dir(),
            open: true,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ImageFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, AcquisitionError> {
        if !self.open {
            return Err(AcquisitionError::NotOpen);
        }
        let Some(path) = self.paths.get(self.index) else {
            return Ok(None);
        };
        self.index += 1;

        let image = image::open(path).map_err(|source| AcquisitionError::Decode {
            path: path.display().to_string(),
            source,
        })?;
        debug!("Loaded {}", path.display());
        Ok(Some(Frame::from_image(&image)))
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn rewind(&mut self) -> bool {
        if !self.replayable {
            return false;
        }
        self.index = 0;
        self.open
    }

    fn release(&mut self) {
        self.open = false;
    }

    fn describe(&self) -> String {
        match self.paths.as_slice() {
            [single] => format!("image {}", single.display()),
            paths => format!("{} images", paths.len()),
        }
    }
}

/// Radius of the default close and dilate passes.
const DEFAULT_MORPH_RADIUS: u8 = 2;

/// Frames between changes of the synthetic box type.
const SEGMENT_FRAMES: u64 = 15;

/// Growth per axis of the outer edge-map contour around a shape drawn with a
/// one-pixel mid-tone border.
///
/// The border makes the blurred step odd-symmetric about the border pixel, so
/// Canny keeps exactly that pixel instead of a rounding-dependent one or two.
/// The border lies one pixel outside the fill on each side, and the dilation
/// adds `morph_radius` on each side; closing a thin outline adds nothing.
pub fn edge_growth_px(morph_radius: u8) -> f64 {
    2.0 * f64::from(morph_radius) + 1.0
}

/// Renders a reference square on the left and one catalog box to its right,
/// with positional jitter. The box type changes every few frames unless
/// pinned with [`SyntheticSceneSource::with_box_type`].
pub struct SyntheticSceneSource {
    width: u32,
    height: u32,
    frame_limit: u64,
    produced: u64,
    rng: StdRng,
    seed: u64,
    pixels_per_cm: f64,
    reference_size_cm: f64,
    offset: f64,
    edge_growth_px: f64,
    current: BoxType,
    pinned: Option<BoxType>,
    open: bool,
}

impl SyntheticSceneSource {
    /// `frame_limit == 0` means unlimited.
    pub fn new(width: u32, height: u32, frame_limit: u64, seed: u64) -> Self {
        Self {
            width,
            height,
            frame_limit,
            produced: 0,
            rng: StdRng::seed_from_u64(seed),
            seed,
            pixels_per_cm: 10.0,
            reference_size_cm: 2.0,
            offset: 28.0,
            edge_growth_px: edge_growth_px(DEFAULT_MORPH_RADIUS),
            current: BoxType::TenByTwenty,
            pinned: None,
            open: true,
        }
    }

    /// Sizes the reference so that calibration with these settings recovers
    /// `pixels_per_cm`.
    pub fn with_calibration(mut self, pixels_per_cm: f64, reference_size_cm: f64, offset: f64) -> Self {
        self.pixels_per_cm = pixels_per_cm;
        self.reference_size_cm = reference_size_cm;
        self.offset = offset;
        self
    }

    /// Matches the rendered sizes to the preprocessor's close/dilate radius.
    pub fn with_morph_radius(mut self, morph_radius: u8) -> Self {
        self.edge_growth_px = edge_growth_px(morph_radius);
        self
    }

    /// Shows only this box type instead of cycling through the catalog.
    pub fn with_box_type(mut self, box_type: BoxType) -> Self {
        self.current = box_type;
        self.pinned = Some(box_type);
        self
    }

    pub fn current_type(&self) -> BoxType {
        self.current
    }

    fn drawn_size(&self, measured_px: f64) -> u32 {
        (measured_px - self.edge_growth_px).round().max(1.0) as u32
    }

    fn render(&mut self) -> RgbImage {
        if self.pinned.is_none() && self.produced % SEGMENT_FRAMES == 0 {
            let entry = CATALOG[self.rng.gen_range(0..CATALOG.len())];
            self.current = entry.box_type;
            debug!("Synthetic scene now shows {}", self.current);
        }

        let background = Rgb([self.rng.gen_range(10u8..30); 3]);
        let mut image = RgbImage::from_pixel(self.width, self.height, background);

        let reference_px = (self.pixels_per_cm + self.offset) * self.reference_size_cm;
        let side = self.drawn_size(reference_px);
        let jitter_x = self.rng.gen_range(-3i32..=3);
        let jitter_y = self.rng.gen_range(-3i32..=3);
        draw_bordered_rect(
            &mut image,
            Rect::at(30 + jitter_x, 60 + jitter_y).of_size(side, side),
            Rgb([250, 250, 250]),
            background,
        );

        if let Some(entry) = CATALOG.iter().find(|e| e.box_type == self.current) {
            let w = self.drawn_size(entry.width_cm * self.pixels_per_cm);
            let h = self.drawn_size(entry.height_cm * self.pixels_per_cm);
            let x = 60 + side as i32 + 80 + self.rng.gen_range(-5i32..=5);
            let y = 60 + self.rng.gen_range(-5i32..=5);
            draw_bordered_rect(&mut image, Rect::at(x, y).of_size(w, h), Rgb([235, 205, 165]), background);
        }
        image
    }
}

/// Fills `rect` and surrounds it with a one-pixel border halfway between the
/// fill and the background.
fn draw_bordered_rect(image: &mut RgbImage, rect: Rect, fill: Rgb<u8>, background: Rgb<u8>) {
    let border = Rgb(std::array::from_fn(|i| {
        ((u16::from(fill[i]) + u16::from(background[i])) / 2) as u8
    }));
    draw_filled_rect_mut(
        image,
        Rect::at(rect.left() - 1, rect.top() - 1).of_size(rect.width() + 2, rect.height() + 2),
        border,
    );
    draw_filled_rect_mut(image, rect, fill);
}

impl FrameSource for SyntheticSceneSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, AcquisitionError> {
        if !self.open {
            return Err(AcquisitionError::NotOpen);
        }
        if self.frame_limit > 0 && self.produced >= self.frame_limit {
            return Ok(None);
        }
        let image = self.render();
        self.produced += 1;

        let (width, height) = image.dimensions();
        let mut frame = Frame::new(width, height, 3);
        frame.data = image.into_raw();
        Ok(Some(frame))
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn rewind(&mut self) -> bool {
        self.produced = 0;
        self.rng = StdRng::seed_from_u64(self.seed);
        self.open
    }

    fn release(&mut self) {
        self.open = false;
    }

    fn describe(&self) -> String {
        format!("synthetic scene {}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_source_honours_limit_and_rewind() {
        let mut source = SyntheticSceneSource::new(320, 240, 2, 1);
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());

        assert!(source.rewind());
        let frame = source.next_frame().unwrap().expect("frame after rewind");
        assert_eq!((frame.width, frame.height, frame.channels), (320, 240, 3));
    }

    #[test]
    fn pinned_type_survives_segment_changes() {
        let mut source = SyntheticSceneSource::new(320, 240, 0, 9).with_box_type(BoxType::TwentyByTwenty);
        for _ in 0..(2 * SEGMENT_FRAMES) {
            source.next_frame().unwrap();
            assert_eq!(source.current_type(), BoxType::TwentyByTwenty);
        }
    }

    #[test]
    fn drawn_sizes_leave_room_for_edge_growth() {
        let source = SyntheticSceneSource::new(320, 240, 0, 1);
        assert_eq!(edge_growth_px(2), 5.0);
        assert_eq!(edge_growth_px(0), 1.0);
        // 2 cm reference at 10 px/cm with offset 28 must measure 76 px.
        assert_eq!(source.drawn_size(76.0), 71);

        let wider = SyntheticSceneSource::new(320, 240, 0, 1).with_morph_radius(4);
        assert_eq!(wider.drawn_size(76.0), 67);
    }

    #[test]
    fn border_is_midway_between_fill_and_background() {
        let background = Rgb([20, 20, 20]);
        let mut image = RgbImage::from_pixel(20, 20, background);
        draw_bordered_rect(&mut image, Rect::at(5, 5).of_size(6, 6), Rgb([220, 200, 100]), background);

        assert_eq!(*image.get_pixel(4, 4), Rgb([120, 110, 60]));
        assert_eq!(*image.get_pixel(5, 5), Rgb([220, 200, 100]));
        assert_eq!(*image.get_pixel(11, 8), Rgb([120, 110, 60]));
        assert_eq!(*image.get_pixel(12, 8), background);
    }

    #[test]
    fn released_source_reports_not_open() {
        let mut source = SyntheticSceneSource::new(64, 48, 0, 3);
        source.release();
        assert!(!source.is_open());
        assert!(matches!(source.next_frame(), Err(AcquisitionError::NotOpen)));
    }

    #[test]
    fn image_directory_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.png"] {
            RgbImage::new(8, 8).save(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut source = ImageFileSource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.describe(), "2 images");
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
        assert!(source.rewind());
        assert!(source.next_frame().unwrap().is_some());
    }

    #[test]
    fn undecodable_image_is_an_acquisition_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();

        let mut source = ImageFileSource::open(&path).unwrap();
        assert!(matches!(source.next_frame(), Err(AcquisitionError::Decode { .. })));
    }

    #[test]
    fn single_image_is_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        RgbImage::new(8, 8).save(&path).unwrap();

        let mut source = ImageFileSource::open(&path).unwrap();
        assert_eq!(source.describe(), format!("image {}", path.display()));
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
        assert!(!source.rewind());
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn missing_path_is_rejected() {
        assert!(ImageFileSource::open("/definitely/not/here.png").is_err());
    }
}
