//! Embedded Python converter scripts and deployment utilities.
//!
//! Scripts are stored as string constants and written to disk on first use
//! or when the embedded version changes (detected via hash comparison).
//!
//! Every script reports on stdout as JSON lines `{"stage": ...}`. A failing
//! script prints a final `{"stage": "error", "kind": ...}` line so the runner
//! can classify the failure.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::PathsConfig;
use crate::error::IoResultExt;
use crate::Result;

/// Helpers imported by every converter script.
pub const COMMON_MODULE: &str = r#""""Shared helpers for posecvt converter scripts."""
import json
import os
import re
import sys

UNSUPPORTED_PATTERNS = [
    re.compile(r"'tf\.([A-Za-z0-9_]+)' op is neither a custom op nor a flex op"),
    re.compile(r"[Uu]nsupported (?:op|operator|onnx op)[: ]+'?([A-Za-z0-9_]+)"),
    re.compile(r"([A-Za-z0-9_]+) is not (?:implemented|supported)"),
]


def progress(stage, **kwargs):
    """Emit a JSON progress line to stdout."""
    print(json.dumps({"stage": stage, **kwargs}), flush=True)


def fail(kind, message, **kwargs):
    """Emit a classified error line and exit non-zero."""
    progress("error", kind=kind, message=message[:4000], **kwargs)
    sys.exit(1)


def classify(exc):
    """Report an exception raised by a converter."""
    text = str(exc)
    for pattern in UNSUPPORTED_PATTERNS:
        match = pattern.search(text)
        if match:
            fail("unsupported_operator", text, operator=match.group(1))
    fail("conversion_failed", f"{type(exc).__name__}: {text}")


def require(module):
    """Import an optional library or report it as missing."""
    try:
        return __import__(module, fromlist=["_"])
    except ImportError as e:
        fail("missing_dependency", str(e), library=module)


def complete(output_path):
    """Report the finished artifact and its size."""
    if os.path.isdir(output_path):
        size = sum(
            os.path.getsize(os.path.join(root, name))
            for root, _, names in os.walk(output_path)
            for name in names
        )
    else:
        size = os.path.getsize(output_path)
    progress("complete", output_path=output_path, output_size=size)
"#;

/// Native checkpoint to ONNX via the ultralytics exporter.
pub const EXPORT_ONNX_SCRIPT: &str = r#"#!/usr/bin/env python3
"""Export a native pose checkpoint to ONNX at a fixed input resolution.

Weights stay float32; the exporter does not quantize.
"""
import argparse
import os
import shutil

from _posecvt_common import classify, complete, fail, progress, require


def main():
    parser = argparse.ArgumentParser(description="Export checkpoint to ONNX")
    parser.add_argument("--weights", required=True)
    parser.add_argument("--output", required=True)
    parser.add_argument("--imgsz", type=int, default=320)
    parser.add_argument("--opset", type=int, default=13)
    parser.add_argument("--simplify", action="store_true")
    parser.add_argument("--dynamic", action="store_true")
    args = parser.parse_args()

    ultralytics = require("ultralytics")
    require("onnx")

    # The exporter writes next to its input, so work on a private copy.
    work_dir = os.path.dirname(os.path.abspath(args.output))
    local_weights = os.path.join(work_dir, "model.pt")
    shutil.copyfile(args.weights, local_weights)

    progress("validating", message="Loading checkpoint...")
    try:
        model = ultralytics.YOLO(local_weights)
    except Exception as e:
        fail("malformed_input", f"cannot load checkpoint: {e}")

    progress("converting", message=f"Exporting ONNX (imgsz={args.imgsz}, opset={args.opset})")
    try:
        exported = model.export(
            format="onnx",
            imgsz=args.imgsz,
            opset=args.opset,
            simplify=args.simplify,
            dynamic=args.dynamic,
        )
    except Exception as e:
        classify(e)

    progress("writing", message="Moving export into place...")
    shutil.move(str(exported), args.output)
    complete(args.output)


if __name__ == "__main__":
    main()
"#;

/// Native checkpoint straight to TFLite via the ultralytics exporter.
pub const EXPORT_TFLITE_SCRIPT: &str = r#"#!/usr/bin/env python3
"""Export a native pose checkpoint directly to TFLite in one step."""
import argparse
import os
import shutil

from _posecvt_common import classify, complete, fail, progress, require


def main():
    parser = argparse.ArgumentParser(description="Export checkpoint to TFLite")
    parser.add_argument("--weights", required=True)
    parser.add_argument("--output", required=True)
    parser.add_argument("--imgsz", type=int, default=320)
    parser.add_argument("--optimization", choices=["none", "size", "latency"], default="none")
    args = parser.parse_args()

    ultralytics = require("ultralytics")
    require("tensorflow")

    work_dir = os.path.dirname(os.path.abspath(args.output))
    local_weights = os.path.join(work_dir, "model.pt")
    shutil.copyfile(args.weights, local_weights)

    progress("validating", message="Loading checkpoint...")
    try:
        model = ultralytics.YOLO(local_weights)
    except Exception as e:
        fail("malformed_input", f"cannot load checkpoint: {e}")

    progress("converting", message=f"Exporting TFLite (imgsz={args.imgsz})")
    try:
        exported = model.export(
            format="tflite",
            imgsz=args.imgsz,
            half=args.optimization == "size",
            int8=False,
        )
    except Exception as e:
        classify(e)

    progress("writing", message="Moving export into place...")
    shutil.move(str(exported), args.output)
    complete(args.output)


if __name__ == "__main__":
    main()
"#;

/// ONNX to SavedModel via onnx-tensorflow.
pub const ONNX_TF_BRIDGE_SCRIPT: &str = r#"#!/usr/bin/env python3
"""Rehydrate an ONNX graph as a TensorFlow SavedModel using onnx-tf."""
import argparse

from _posecvt_common import classify, complete, fail, progress, require


def main():
    parser = argparse.ArgumentParser(description="ONNX to SavedModel (onnx-tf)")
    parser.add_argument("--input", required=True)
    parser.add_argument("--output", required=True)
    args = parser.parse_args()

    onnx = require("onnx")
    backend = require("onnx_tf.backend")
    require("tensorflow")

    progress("validating", message="Checking ONNX graph...")
    try:
        model = onnx.load(args.input)
        onnx.checker.check_model(model)
    except Exception as e:
        fail("malformed_input", f"invalid ONNX graph: {e}")

    progress("converting", message="Preparing TensorFlow representation...")
    try:
        rep = backend.prepare(model)
        progress("writing", message="Exporting SavedModel...")
        rep.export_graph(args.output)
    except Exception as e:
        classify(e)

    complete(args.output)


if __name__ == "__main__":
    main()
"#;

/// ONNX to SavedModel via onnx2tf.
pub const ONNX2TF_BRIDGE_SCRIPT: &str = r#"#!/usr/bin/env python3
"""Rehydrate an ONNX graph as a TensorFlow SavedModel using onnx2tf."""
import argparse

from _posecvt_common import classify, complete, fail, progress, require


def main():
    parser = argparse.ArgumentParser(description="ONNX to SavedModel (onnx2tf)")
    parser.add_argument("--input", required=True)
    parser.add_argument("--output", required=True)
    args = parser.parse_args()

    onnx = require("onnx")
    onnx2tf = require("onnx2tf")
    require("tensorflow")

    progress("validating", message="Checking ONNX graph...")
    try:
        onnx.checker.check_model(onnx.load(args.input))
    except Exception as e:
        fail("malformed_input", f"invalid ONNX graph: {e}")

    progress("converting", message="Converting with onnx2tf...")
    try:
        onnx2tf.convert(
            input_onnx_file_path=args.input,
            output_folder_path=args.output,
            non_verbose=True,
        )
    except Exception as e:
        classify(e)

    complete(args.output)


if __name__ == "__main__":
    main()
"#;

/// SavedModel to TFLite via the TensorFlow Lite converter.
pub const COMPILE_TFLITE_SCRIPT: &str = r#"#!/usr/bin/env python3
"""Compile a SavedModel into a TFLite flatbuffer.

--profile strict      TFLITE_BUILTINS only
--profile permissive  TFLITE_BUILTINS + SELECT_TF_OPS (needs the Flex delegate at runtime)
"""
import argparse
import os

from _posecvt_common import classify, complete, fail, progress, require


def main():
    parser = argparse.ArgumentParser(description="SavedModel to TFLite")
    parser.add_argument("--saved-model", required=True)
    parser.add_argument("--output", required=True)
    parser.add_argument("--profile", choices=["strict", "permissive"], default="strict")
    parser.add_argument("--optimization", choices=["none", "size", "latency"], default="none")
    args = parser.parse_args()

    tf = require("tensorflow")

    progress("validating", message="Checking SavedModel...")
    if not os.path.isfile(os.path.join(args.saved_model, "saved_model.pb")):
        fail("malformed_input", f"no saved_model.pb in {args.saved_model}")

    try:
        converter = tf.lite.TFLiteConverter.from_saved_model(args.saved_model)
    except Exception as e:
        fail("malformed_input", f"cannot load SavedModel: {e}")

    ops = [tf.lite.OpsSet.TFLITE_BUILTINS]
    if args.profile == "permissive":
        ops.append(tf.lite.OpsSet.SELECT_TF_OPS)
    converter.target_spec.supported_ops = ops

    if args.optimization == "none":
        converter.optimizations = []
    elif args.optimization == "size":
        converter.optimizations = [tf.lite.Optimize.DEFAULT]
        converter.target_spec.supported_types = [tf.float16]
    else:
        converter.optimizations = [tf.lite.Optimize.DEFAULT]

    progress("converting", message=f"Compiling TFLite ({args.profile}, {args.optimization})")
    try:
        flatbuffer = converter.convert()
    except Exception as e:
        classify(e)

    progress("writing", message="Writing flatbuffer...")
    with open(args.output, "wb") as f:
        f.write(flatbuffer)
    complete(args.output)


if __name__ == "__main__":
    main()
"#;

/// An embedded converter script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    ExportOnnx,
    ExportTflite,
    OnnxTfBridge,
    Onnx2TfBridge,
    CompileTflite,
}

impl Script {
    pub const ALL: [Script; 5] = [
        Script::ExportOnnx,
        Script::ExportTflite,
        Script::OnnxTfBridge,
        Script::Onnx2TfBridge,
        Script::CompileTflite,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Script::ExportOnnx => "export_onnx.py",
            Script::ExportTflite => "export_tflite.py",
            Script::OnnxTfBridge => "onnx_tf_bridge.py",
            Script::Onnx2TfBridge => "onnx2tf_bridge.py",
            Script::CompileTflite => "compile_tflite.py",
        }
    }

    pub fn content(&self) -> &'static str {
        match self {
            Script::ExportOnnx => EXPORT_ONNX_SCRIPT,
            Script::ExportTflite => EXPORT_TFLITE_SCRIPT,
            Script::OnnxTfBridge => ONNX_TF_BRIDGE_SCRIPT,
            Script::Onnx2TfBridge => ONNX2TF_BRIDGE_SCRIPT,
            Script::CompileTflite => COMPILE_TFLITE_SCRIPT,
        }
    }
}

const COMMON_MODULE_FILE: &str = "_posecvt_common.py";

/// Compute a short hash of a string for staleness checking.
fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = hasher.finalize();
    hex::encode(&hash[..8])
}

/// Get the path to the converter scripts directory.
pub fn scripts_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(PathsConfig::SCRIPTS_DIR_NAME)
}

/// Deploy embedded scripts to disk if missing or outdated.
///
/// Uses a `.hash` sidecar file to detect when the embedded script has changed
/// and needs to be rewritten.
pub fn ensure_scripts_deployed(work_dir: &Path) -> Result<PathBuf> {
    let dir = scripts_dir(work_dir);
    std::fs::create_dir_all(&dir).with_path(&dir)?;

    deploy_script(&dir, COMMON_MODULE_FILE, COMMON_MODULE)?;
    for script in Script::ALL {
        deploy_script(&dir, script.file_name(), script.content())?;
    }

    info!("Converter scripts deployed to {}", dir.display());
    Ok(dir)
}

fn deploy_script(dir: &Path, filename: &str, content: &str) -> Result<()> {
    let script_path = dir.join(filename);
    let hash_path = dir.join(format!("{}.hash", filename));
    let current_hash = content_hash(content);

    if script_path.exists() {
        if let Ok(stored_hash) = std::fs::read_to_string(&hash_path) {
            if stored_hash.trim() == current_hash {
                return Ok(());
            }
        }
    }

    debug!("Writing {}", script_path.display());
    std::fs::write(&script_path, content).with_path(&script_path)?;
    std::fs::write(&hash_path, &current_hash).with_path(&hash_path)?;
    Ok(())
}
