//! In-process conversion strategy: stack DICOM slices into a NIfTI volume.
//!
//! The first slice of a case supplies the dimensions, pixel type, and
//! spacing for the whole case; every slice is then decoded and copied into
//! its depth index of a preallocated 3-D array, in numeric filename order.
//! Nothing is written until the whole stack has been read, so a decode
//! failure anywhere leaves no output file behind.
//!
//! The affine stored with the volume is a diagonal voxel-size transform
//! only; orientation cosines and origin offsets from the DICOM headers are
//! intentionally not carried over.

use anyhow::{bail, ensure, Context, Result};
use dicom_object::open_file;
use dicom_pixeldata::PixelDecoder;
use ndarray::{s, Array2, Array3};
use nifti::writer::WriterOptions;
use nifti::NiftiHeader;
use std::fs;
use std::path::{Path, PathBuf};

/// Pixel element type of a case, selected from the sample slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelKind {
    U8,
    U16,
    I16,
}

/// Geometry read from the first slice of a case.
#[derive(Debug, Clone)]
pub struct SliceGeometry {
    pub rows: usize,
    pub columns: usize,
    /// Row and column spacing in mm, from PixelSpacing.
    pub pixel_spacing: (f32, f32),
    pub slice_thickness: f32,
    pub kind: PixelKind,
}

/// Stacked pixel data for one case.
pub enum Volume {
    U8(Array3<u8>),
    U16(Array3<u16>),
    I16(Array3<i16>),
}

/// Convert one case directory into a compressed NIfTI volume at `output_path`.
pub fn convert_case(case_dir: &Path, output_path: &Path) -> Result<()> {
    let files = slice_files(case_dir)?;
    let sample = read_geometry(&files[0])?;
    let volume = stack_slices(&files, &sample)?;
    write_volume(output_path, &volume, &sample)
}

/// Regular files of a case directory, ordered by their numeric filename prefix.
pub fn slice_files(case_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(case_dir)
        .with_context(|| format!("Failed to list case directory {}", case_dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let key = slice_sort_key(&path)?;
        files.push((key, path));
    }
    ensure!(
        !files.is_empty(),
        "no slice files in {}",
        case_dir.display()
    );
    files.sort_by_key(|(key, _)| *key);
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Numeric prefix of a slice file name ("12.dcm" sorts as 12).
fn slice_sort_key(path: &Path) -> Result<u64> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits
        .parse()
        .with_context(|| format!("slice file name {:?} has no numeric prefix", name))
}

/// Read dimensions, spacing, and pixel type from a sample slice.
pub fn read_geometry(path: &Path) -> Result<SliceGeometry> {
    let obj = open_file(path)
        .with_context(|| format!("Failed to open DICOM file {}", path.display()))?;

    let rows = obj
        .element_by_name("Rows")
        .with_context(|| format!("{} has no Rows", path.display()))?
        .to_int::<u16>()? as usize;
    let columns = obj
        .element_by_name("Columns")
        .with_context(|| format!("{} has no Columns", path.display()))?
        .to_int::<u16>()? as usize;

    let spacing = obj
        .element_by_name("PixelSpacing")
        .with_context(|| format!("{} has no PixelSpacing", path.display()))?
        .to_multi_float64()?;
    ensure!(
        spacing.len() >= 2,
        "{} carries {} PixelSpacing values, expected 2",
        path.display(),
        spacing.len()
    );
    let slice_thickness = obj
        .element_by_name("SliceThickness")
        .with_context(|| format!("{} has no SliceThickness", path.display()))?
        .to_float64()? as f32;

    let bits_allocated = obj
        .element_by_name("BitsAllocated")
        .with_context(|| format!("{} has no BitsAllocated", path.display()))?
        .to_int::<u16>()?;
    let representation = obj
        .element_by_name("PixelRepresentation")
        .ok()
        .and_then(|element| element.to_int::<u16>().ok())
        .unwrap_or(0);

    let kind = match (bits_allocated, representation) {
        (8, _) => PixelKind::U8,
        (16, 0) => PixelKind::U16,
        (16, _) => PixelKind::I16,
        (bits, _) => bail!(
            "{} allocates {} bits per pixel, only 8 and 16 are supported",
            path.display(),
            bits
        ),
    };

    Ok(SliceGeometry {
        rows,
        columns,
        pixel_spacing: (spacing[0] as f32, spacing[1] as f32),
        slice_thickness,
        kind,
    })
}

macro_rules! stack_impl {
    ($name:ident, $ty:ty) => {
        fn $name(files: &[PathBuf], rows: usize, columns: usize) -> Result<Array3<$ty>> {
            let mut volume = Array3::<$ty>::zeros((rows, columns, files.len()));
            for (index, path) in files.iter().enumerate() {
                let obj = open_file(path)
                    .with_context(|| format!("Failed to open slice {}", path.display()))?;
                let decoded = obj.decode_pixel_data().with_context(|| {
                    format!("Failed to decode pixel data of {}", path.display())
                })?;
                ensure!(
                    decoded.rows() as usize == rows && decoded.columns() as usize == columns,
                    "slice {} is {}x{}, expected {}x{}",
                    path.display(),
                    decoded.rows(),
                    decoded.columns(),
                    rows,
                    columns
                );
                let pixels: Vec<$ty> = decoded.to_vec().with_context(|| {
                    format!("Failed to convert pixel data of {}", path.display())
                })?;
                ensure!(
                    pixels.len() == rows * columns,
                    "slice {} holds {} pixels, expected {}",
                    path.display(),
                    pixels.len(),
                    rows * columns
                );
                let plane = Array2::from_shape_vec((rows, columns), pixels)?;
                volume.slice_mut(s![.., .., index]).assign(&plane);
            }
            Ok(volume)
        }
    };
}

stack_impl!(stack_u8, u8);
stack_impl!(stack_u16, u16);
stack_impl!(stack_i16, i16);

/// Decode every slice file into a volume of the sample's pixel type.
fn stack_slices(files: &[PathBuf], sample: &SliceGeometry) -> Result<Volume> {
    Ok(match sample.kind {
        PixelKind::U8 => Volume::U8(stack_u8(files, sample.rows, sample.columns)?),
        PixelKind::U16 => Volume::U16(stack_u16(files, sample.rows, sample.columns)?),
        PixelKind::I16 => Volume::I16(stack_i16(files, sample.rows, sample.columns)?),
    })
}

/// 4x4 identity with the voxel sizes on the diagonal.
pub fn diagonal_affine(pixel_spacing: (f32, f32), slice_thickness: f32) -> [[f32; 4]; 4] {
    let mut affine = [[0.0f32; 4]; 4];
    affine[0][0] = pixel_spacing.0;
    affine[1][1] = pixel_spacing.1;
    affine[2][2] = slice_thickness;
    affine[3][3] = 1.0;
    affine
}

/// Persist the volume as a gzip-compressed NIfTI file.
///
/// The `.nii.gz` suffix of the output path selects compression; the affine
/// goes out as the sform with matching pixdim entries.
fn write_volume(path: &Path, volume: &Volume, sample: &SliceGeometry) -> Result<()> {
    let affine = diagonal_affine(sample.pixel_spacing, sample.slice_thickness);
    let mut header = NiftiHeader::default();
    header.pixdim = [
        1.0,
        sample.pixel_spacing.0,
        sample.pixel_spacing.1,
        sample.slice_thickness,
        1.0,
        1.0,
        1.0,
        1.0,
    ];
    header.sform_code = 1;
    header.srow_x = affine[0];
    header.srow_y = affine[1];
    header.srow_z = affine[2];

    let options = WriterOptions::new(path).reference_header(&header);
    match volume {
        Volume::U8(data) => options.write_nifti(data),
        Volume::U16(data) => options.write_nifti(data),
        Volume::I16(data) => options.write_nifti(data),
    }
    .with_context(|| format!("Failed to write {}", path.display()))
}
