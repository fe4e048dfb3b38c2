use serde::{Deserialize, Serialize};

use crate::core::resources::requirements::ResourceRequirements;
use crate::core::resources::units::{Millicore, ShortByteSize};
use crate::errors::{Error, Result};

fn default_replica_step() -> i32 {
    1
}

/// CPU allocation setting in Millicore units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuSetting {
    pub min: Millicore,
    pub max: Millicore,
    pub step: Millicore,
    #[serde(default)]
    pub value: Option<Millicore>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(skip, default)]
    pub requirements: ResourceRequirements,
}

/// Memory allocation setting in byte units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemorySetting {
    pub min: ShortByteSize,
    pub max: ShortByteSize,
    pub step: ShortByteSize,
    #[serde(default)]
    pub value: Option<ShortByteSize>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(skip, default)]
    pub requirements: ResourceRequirements,
}

/// Replica count setting for a controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicasSetting {
    pub min: i32,
    pub max: i32,
    #[serde(default = "default_replica_step")]
    pub step: i32,
    #[serde(default)]
    pub value: Option<i32>,
    #[serde(default)]
    pub pinned: bool,
}

impl ReplicasSetting {
    /// The fixed single-replica setting a tuning pod reports.
    pub fn pinned_single() -> Self {
        ReplicasSetting {
            min: 0,
            max: 1,
            step: 1,
            value: Some(1),
            pinned: true,
        }
    }
}

/// A scalar reported to the optimizer: vCPU fractions and gibibytes are
/// floats, replica counts are integers.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(untagged)]
pub enum SettingValue {
    Float(f64),
    Int(i64),
}

/// Optimizer-facing representation of a single tunable setting.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SettingDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub setting_type: String,
    pub min: SettingValue,
    pub max: SettingValue,
    pub step: SettingValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<SettingValue>,
    pub pinned: bool,
}

impl CpuSetting {
    pub fn descriptor(&self) -> SettingDescriptor {
        SettingDescriptor {
            name: "cpu".to_string(),
            setting_type: "range".to_string(),
            min: SettingValue::Float(self.min.to_vcpus()),
            max: SettingValue::Float(self.max.to_vcpus()),
            step: SettingValue::Float(self.step.to_vcpus()),
            value: self.value.map(|v| SettingValue::Float(v.to_vcpus())),
            pinned: self.pinned,
        }
    }
}

impl MemorySetting {
    pub fn descriptor(&self) -> SettingDescriptor {
        SettingDescriptor {
            name: "mem".to_string(),
            setting_type: "range".to_string(),
            min: SettingValue::Float(self.min.to_gib()),
            max: SettingValue::Float(self.max.to_gib()),
            step: SettingValue::Float(self.step.to_gib()),
            value: self.value.map(|v| SettingValue::Float(v.to_gib())),
            pinned: self.pinned,
        }
    }
}

impl ReplicasSetting {
    pub fn descriptor(&self) -> SettingDescriptor {
        SettingDescriptor {
            name: "replicas".to_string(),
            setting_type: "range".to_string(),
            min: SettingValue::Int(self.min as i64),
            max: SettingValue::Int(self.max as i64),
            step: SettingValue::Int(self.step as i64),
            value: self.value.map(|v| SettingValue::Int(v as i64)),
            pinned: self.pinned,
        }
    }
}

/// A named target with its tunable settings, the canonical representation of
/// systems under optimization exchanged with the optimizer service.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Component {
    pub name: String,
    pub settings: Vec<SettingDescriptor>,
}

/// A consistent snapshot of every component under optimization.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Description {
    pub components: Vec<Component>,
}

/// A single setting change requested by the optimizer, targeted at a
/// component by name.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Adjustment {
    pub component_name: String,
    pub setting_name: String,
    pub value: serde_json::Value,
}

/// An adjustment value normalized into a Kubernetes-native setting.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedSetting {
    Cpu(Millicore),
    Memory(ShortByteSize),
    Replicas(i32),
}

/// Normalize an adjustment into a native setting. The optimizer reports
/// memory as "mem" in gibibyte units and CPU as vCPU fractions; replica
/// counts may arrive as floats.
pub fn normalize_adjustment(adjustment: &Adjustment) -> Result<NormalizedSetting> {
    let setting = match adjustment.setting_name.as_str() {
        "mem" => "memory",
        name => name,
    };

    match setting {
        "cpu" => Millicore::from_value(&adjustment.value).map(NormalizedSetting::Cpu),
        "memory" => {
            let value = match &adjustment.value {
                serde_json::Value::Number(n) => {
                    let gib = n.as_f64().ok_or_else(|| {
                        Error::AdjustmentFailure(format!("could not parse memory value: {n}"))
                    })?;
                    ShortByteSize::from(gib)
                }
                // Bare numeric strings are gibibytes, the optimizer's unit.
                serde_json::Value::String(s) => match s.parse::<f64>() {
                    Ok(gib) => ShortByteSize::from(gib),
                    Err(_) => s.parse()?,
                },
                other => {
                    return Err(Error::AdjustmentFailure(format!(
                        "could not parse memory value: {other}"
                    )))
                }
            };
            Ok(NormalizedSetting::Memory(value))
        }
        "replicas" => {
            let replicas = match &adjustment.value {
                serde_json::Value::Number(n) => n.as_f64().map(|v| v as i32),
                serde_json::Value::String(s) => s.parse::<f64>().ok().map(|v| v as i32),
                _ => None,
            };
            replicas.map(NormalizedSetting::Replicas).ok_or_else(|| {
                Error::AdjustmentFailure(format!(
                    "could not parse replicas value: {}",
                    adjustment.value
                ))
            })
        }
        other => Err(Error::AdjustmentFailure(format!(
            "failed adjustment of unsupported Kubernetes setting '{other}'"
        ))),
    }
}
