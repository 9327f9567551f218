//! Reading layer files through the `openusd` crate
//!
//! Only what the proxy-stage core needs is carried over: the prim
//! hierarchy, type names, `active`, payload presence and attribute default
//! values of the scalar/vector kinds used for bounds and purposes.

use std::io::{Cursor, Read};
use std::path::Path;

use glam::DVec3;
use openusd::sdf::{self, AbstractData, Value as SdfValue};

use crate::error::UsdError;
use crate::usd::layer::{AttributeSpec, LayerData, PrimSpec, Specifier};
use crate::usd::path::SdfPath;
use crate::usd::value::Value;

/// File extensions handled by the reader
pub const USD_EXTENSIONS: &[&str] = &["usd", "usda", "usdc"];

pub fn is_usd_extension(ext: &str) -> bool {
    USD_EXTENSIONS.contains(&ext.to_lowercase().as_str())
}

/// Read a layer file into layer data
pub fn read_layer(path: &Path) -> Result<LayerData, UsdError> {
    let open_error = |message: String| UsdError::LayerOpen {
        path: path.to_path_buf(),
        message,
    };

    if !path.exists() {
        return Err(open_error("file not found".to_string()));
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    if !is_usd_extension(extension) {
        return Err(open_error(format!("unsupported extension '{}'", extension)));
    }

    let mut header = [0u8; 8];
    let is_crate = std::fs::File::open(path)
        .and_then(|mut file| file.read_exact(&mut header))
        .map(|_| &header == b"PXR-USDC")
        .unwrap_or(false);

    let mut data: Box<dyn AbstractData> = if is_crate {
        let bytes = std::fs::read(path)?;
        let crate_data = openusd::usdc::CrateData::open(Cursor::new(bytes), true)
            .map_err(|e| open_error(format!("failed to parse USDC: {}", e)))?;
        Box::new(crate_data)
    } else {
        let path_str = path
            .to_str()
            .ok_or_else(|| open_error("path is not valid UTF-8".to_string()))?;
        let reader = openusd::usda::TextReader::read(path_str)
            .map_err(|e| open_error(format!("failed to parse USDA: {}", e)))?;
        Box::new(reader)
    };

    let mut layer = LayerData::default();
    let root = sdf::Path::abs_root();
    for child in token_vec(data.as_mut(), &root, "primChildren") {
        read_prim_recursive(data.as_mut(), &SdfPath::absolute_root(), &child, &mut layer);
    }
    Ok(layer)
}

fn read_prim_recursive(
    data: &mut dyn AbstractData,
    parent: &SdfPath,
    name: &str,
    layer: &mut LayerData,
) {
    let Ok(path) = parent.append_child(name) else {
        log::warn!("Skipping prim with unsupported name '{}' under {}", name, parent);
        return;
    };
    let Ok(sdf_path) = sdf::Path::new(path.as_str()) else {
        return;
    };

    let mut spec = PrimSpec {
        specifier: Specifier::Def,
        type_name: token(data, &sdf_path, "typeName"),
        ..PrimSpec::default()
    };
    if let Ok(active) = data.get(&sdf_path, "active") {
        if let SdfValue::Bool(b) = active.as_ref() {
            spec.active = Some(*b);
        }
    }
    spec.has_payload = data.get(&sdf_path, "payload").is_ok();

    for property in token_vec(data, &sdf_path, "properties") {
        let Ok(property_path) = sdf::Path::new(&format!("{}.{}", path.as_str(), property)) else {
            continue;
        };
        if let Ok(value) = data.get(&property_path, "default") {
            if let Some(value) = convert_value(value.as_ref()) {
                spec.attributes
                    .insert(property.clone(), AttributeSpec::with_default(value));
            }
        }
    }

    let children = token_vec(data, &sdf_path, "primChildren");
    layer.insert_spec(path.clone(), spec);
    for child in children {
        read_prim_recursive(data, &path, &child, layer);
    }
}

fn token(data: &mut dyn AbstractData, path: &sdf::Path, field: &str) -> Option<String> {
    let value = data.get(path, field).ok()?;
    match value.as_ref() {
        SdfValue::Token(s) | SdfValue::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn token_vec(data: &mut dyn AbstractData, path: &sdf::Path, field: &str) -> Vec<String> {
    match data.get(path, field) {
        Ok(value) => match value.as_ref() {
            SdfValue::TokenVec(v) => v.clone(),
            _ => Vec::new(),
        },
        Err(_) => Vec::new(),
    }
}

fn vec3s<T: Copy + Into<f64>>(flat: &[T]) -> Vec<DVec3> {
    flat.chunks_exact(3)
        .map(|c| DVec3::new(c[0].into(), c[1].into(), c[2].into()))
        .collect()
}

fn convert_value(value: &SdfValue) -> Option<Value> {
    let converted = match value {
        SdfValue::Bool(b) => Value::Bool(*b),
        SdfValue::Int(i) => Value::Int(i64::from(*i)),
        SdfValue::Int64(i) => Value::Int(*i),
        SdfValue::Float(f) => Value::Double(f64::from(*f)),
        SdfValue::Double(d) => Value::Double(*d),
        SdfValue::Token(s) => Value::Token(s.clone()),
        SdfValue::String(s) => Value::String(s.clone()),
        SdfValue::TokenVec(v) => Value::TokenArray(v.clone()),
        SdfValue::DoubleVec(v) => Value::DoubleArray(v.clone()),
        SdfValue::Vec3f(flat) => vec3_value(vec3s(flat)),
        SdfValue::Vec3d(flat) => vec3_value(vec3s(flat)),
        _ => return None,
    };
    Some(converted)
}

// A single float3/double3 comes back as a 3-element flat vector; arrays
// (extent, points) as a multiple of three.
fn vec3_value(values: Vec<DVec3>) -> Value {
    if values.len() == 1 {
        Value::Vec3(values[0])
    } else {
        Value::Vec3Array(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_check() {
        assert!(is_usd_extension("USDA"));
        assert!(is_usd_extension("usdc"));
        assert!(!is_usd_extension("abc"));
    }

    #[test]
    fn test_missing_file() {
        let err = read_layer(Path::new("/nonexistent/scene.usda")).unwrap_err();
        assert!(matches!(err, UsdError::LayerOpen { .. }));
    }

    #[test]
    fn test_read_usda_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.usda");
        std::fs::write(
            &path,
            "#usda 1.0\n\ndef Xform \"World\"\n{\n    def Cube \"cube\"\n    {\n        double size = 4\n    }\n}\n",
        )
        .unwrap();

        let data = read_layer(&path).unwrap();
        let world = SdfPath::new("/World").unwrap();
        let cube = SdfPath::new("/World/cube").unwrap();

        assert_eq!(data.spec(&SdfPath::absolute_root()).unwrap().children, vec!["World"]);
        assert_eq!(data.spec(&world).unwrap().type_name.as_deref(), Some("Xform"));
        let cube_spec = data.spec(&cube).unwrap();
        assert_eq!(cube_spec.type_name.as_deref(), Some("Cube"));
        assert_eq!(
            cube_spec.attributes.get("size").and_then(|a| a.default.clone()),
            Some(Value::Double(4.0))
        );
    }
}
