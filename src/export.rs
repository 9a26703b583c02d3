use std::{fs, path::{Path, PathBuf}};

use anyhow::{Context, Result};

use crate::node::NodeOut;

/// Write each non-empty output slot to `out_dir`: the message as
/// `output_<slot>.json` (images left out) and, when present, the outlined
/// image as `output_<slot>_outlined.<png|jpg>`.
pub fn write_outputs(outputs: &NodeOut, out_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("could not create {}", out_dir.display()))?;

    let mut written = vec![];
    for (slot, msg) in outputs.iter().enumerate() {
        let Some(msg) = msg else { continue };

        let json_path = out_dir.join(format!("output_{slot}.json"));
        fs::write(&json_path, serde_json::to_string_pretty(&msg.without_images())?)?;
        written.push(json_path);

        if let Some(image) = msg.outlined_image() {
            let ext = match image::guess_format(image) {
                Ok(image::ImageFormat::Png) => "png",
                _ => "jpg",
            };
            let image_path = out_dir.join(format!("output_{slot}_outlined.{ext}"));
            fs::write(&image_path, image)?;
            written.push(image_path);
        }
    }
    Ok(written)
}
