//! Model checkpoints in safetensors format.

use std::path::Path;

use candle_nn::VarMap;
use ddpm_core::DdpmError;

/// Writes every variable in `var_map` (weights and BatchNorm running
/// statistics) to `path`, creating parent directories.
///
/// # Errors
///
/// Returns [`DdpmError::Io`] if the directory cannot be created and
/// [`DdpmError::Internal`] if serialization fails.
pub fn save_checkpoint(var_map: &VarMap, path: &Path) -> Result<(), DdpmError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| DdpmError::io(parent, e))?;
    }
    var_map.save(path).map_err(|e| DdpmError::Internal {
        message: format!("save_checkpoint {}: {e}", path.display()),
    })?;
    tracing::info!(path = %path.display(), "saved model");
    Ok(())
}

/// Loads weights into an already-built model's `var_map`. Every variable
/// the model registered must be present in the file with the same shape.
///
/// # Errors
///
/// Returns [`DdpmError::Io`] if the file does not exist and
/// [`DdpmError::Internal`] on missing tensors or shape mismatches.
pub fn load_checkpoint(var_map: &mut VarMap, path: &Path) -> Result<(), DdpmError> {
    if !path.is_file() {
        return Err(DdpmError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "checkpoint not found"),
        ));
    }
    var_map.load(path).map_err(|e| DdpmError::Internal {
        message: format!("load_checkpoint {}: {e}", path.display()),
    })?;
    tracing::info!(path = %path.display(), "loaded model");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use ddpm_model::Ddpm;

    #[test]
    fn missing_checkpoint_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut var_map = VarMap::new();
        let err = load_checkpoint(&mut var_map, &dir.path().join("none.safetensors")).unwrap_err();
        assert!(matches!(err, DdpmError::Io { .. }));
    }

    #[test]
    fn architecture_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt").join("model.safetensors");

        let small = VarMap::new();
        Ddpm::new(&small, 8, 5, (1e-4, 0.02), &Device::Cpu).unwrap();
        save_checkpoint(&small, &path).unwrap();
        assert!(path.is_file());

        let mut wide = VarMap::new();
        Ddpm::new(&wide, 16, 5, (1e-4, 0.02), &Device::Cpu).unwrap();
        assert!(load_checkpoint(&mut wide, &path).is_err());
    }
}
