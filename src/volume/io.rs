use std::path::Path;

use ndarray::Array3;
use ndarray_npy::{read_npy, write_npy, ReadNpyError, ReadableElement};

use crate::error::DataError;

fn npy_error(path: &Path, message: impl ToString) -> DataError {
    DataError::Npy {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// `Ok(None)` when the file holds a different dtype.
fn try_read<A: ReadableElement>(path: &Path) -> Result<Option<Array3<A>>, DataError> {
    match read_npy::<_, Array3<A>>(path) {
        Ok(array) => Ok(Some(array)),
        Err(ReadNpyError::WrongDescriptor(_)) => Ok(None),
        Err(e) => Err(npy_error(path, e)),
    }
}

fn narrow<A>(array: Array3<A>, path: &Path) -> Result<Array3<u8>, DataError>
where
    A: Copy + TryInto<u8> + std::fmt::Display,
{
    let mut out = Array3::<u8>::zeros(array.dim());
    for (dst, &src) in out.iter_mut().zip(array.iter()) {
        *dst = src
            .try_into()
            .map_err(|_| npy_error(path, format!("label value {src} does not fit in u8")))?;
    }
    Ok(out)
}

/// Read a raw scan as `f32`, accepting the integer and float dtypes scanners export.
pub fn read_volume(path: &Path) -> Result<Array3<f32>, DataError> {
    if let Some(a) = try_read::<f32>(path)? {
        return Ok(a);
    }
    if let Some(a) = try_read::<f64>(path)? {
        return Ok(a.mapv(|v| v as f32));
    }
    if let Some(a) = try_read::<i16>(path)? {
        return Ok(a.mapv(f32::from));
    }
    if let Some(a) = try_read::<u16>(path)? {
        return Ok(a.mapv(f32::from));
    }
    if let Some(a) = try_read::<i32>(path)? {
        return Ok(a.mapv(|v| v as f32));
    }
    if let Some(a) = try_read::<i64>(path)? {
        return Ok(a.mapv(|v| v as f32));
    }
    if let Some(a) = try_read::<u8>(path)? {
        return Ok(a.mapv(f32::from));
    }
    Err(npy_error(path, "unsupported dtype for a volume"))
}

/// Read an integer label map.
pub fn read_labels(path: &Path) -> Result<Array3<u8>, DataError> {
    if let Some(a) = try_read::<u8>(path)? {
        return Ok(a);
    }
    if let Some(a) = try_read::<i64>(path)? {
        return narrow(a, path);
    }
    if let Some(a) = try_read::<i32>(path)? {
        return narrow(a, path);
    }
    if let Some(a) = try_read::<i16>(path)? {
        return narrow(a, path);
    }
    if let Some(a) = try_read::<u16>(path)? {
        return narrow(a, path);
    }
    Err(npy_error(path, "label maps must be integer typed"))
}

pub fn write_labels(path: &Path, labels: &Array3<u8>) -> Result<(), DataError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| npy_error(path, e))?;
    }
    write_npy(path, labels).map_err(|e| npy_error(path, e))
}
