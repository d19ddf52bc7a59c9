//! Output directory naming derived from the checkpoint path.

use anyhow::{bail, Result};

/// Classify a checkpoint path into a run name.
///
/// The base name comes from the first marker found among `scratch`, `CC`
/// and `dalle_checkpoint`; `auxLR2`/`auxLR` add a suffix and `overall` a
/// prefix. A path with no base marker is rejected.
pub fn run_name(checkpoint_path: &str) -> Result<String> {
    let base = if checkpoint_path.contains("scratch") {
        "scratch"
    } else if checkpoint_path.contains("CC") {
        "CC"
    } else if checkpoint_path.contains("dalle_checkpoint") {
        "CCzero"
    } else {
        bail!(
            "cannot derive a run name from checkpoint path '{checkpoint_path}': \
             expected it to contain 'scratch', 'CC' or 'dalle_checkpoint'"
        );
    };

    let mut name = base.to_string();
    if checkpoint_path.contains("auxLR2") {
        name.push_str("_auxLR2");
    } else if checkpoint_path.contains("auxLR") {
        name.push_str("_auxLR");
    }
    if checkpoint_path.contains("overall") {
        name.insert_str(0, "overall_");
    }
    Ok(name)
}

/// `<skill_name>_<run_name>_<split>`
pub fn output_dir_name(skill_name: &str, run_name: &str, split: &str) -> String {
    format!("{skill_name}_{run_name}_{split}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_names() {
        assert_eq!(run_name("ckpt/scratch_object.pt").unwrap(), "scratch");
        assert_eq!(run_name("./DALLE_CC_object.safetensors").unwrap(), "CC");
        assert_eq!(run_name("runs/dalle_checkpoint_7.safetensors").unwrap(), "CCzero");
    }

    #[test]
    fn scratch_wins_over_cc() {
        assert_eq!(run_name("CC/scratch.pt").unwrap(), "scratch");
    }

    #[test]
    fn aux_suffixes() {
        assert_eq!(run_name("CC_auxLR2.pt").unwrap(), "CC_auxLR2");
        assert_eq!(run_name("CC_auxLR.pt").unwrap(), "CC_auxLR");
        assert_eq!(run_name("scratch_auxLR10.pt").unwrap(), "scratch_auxLR");
    }

    #[test]
    fn overall_prefix() {
        assert_eq!(run_name("overall/dalle_checkpoint_auxLR2.pt").unwrap(), "overall_CCzero_auxLR2");
    }

    #[test]
    fn unmatched_path_is_an_error() {
        let err = run_name("model_final.pt").unwrap_err().to_string();
        assert!(err.contains("model_final.pt"));
    }

    #[test]
    fn dir_name_layout() {
        assert_eq!(output_dir_name("object", "CC_auxLR", "val"), "object_CC_auxLR_val");
    }
}
