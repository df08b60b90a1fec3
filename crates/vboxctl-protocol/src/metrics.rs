//! Performance metrics wire format.

use crate::ObjectRef;
use serde::{Deserialize, Serialize};

/// Configuration of one metric on one object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub name: String,
    pub object: ObjectRef,
    pub description: String,
    pub unit: String,
    pub minimum: i64,
    pub maximum: i64,
    /// Sampling period in seconds.
    pub period: u32,
    /// Depth of the sample ring buffer.
    pub count: u32,
}

/// Flattened result of `query_metrics_data`.
///
/// Per-metric arrays all have the same length N. The samples of metric `i`
/// are `data[data_indices[i] .. data_indices[i] + data_lengths[i]]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsData {
    pub names: Vec<String>,
    pub objects: Vec<ObjectRef>,
    pub units: Vec<String>,
    pub scales: Vec<u32>,
    pub sequence_numbers: Vec<u32>,
    pub data_indices: Vec<u32>,
    pub data_lengths: Vec<u32>,
    pub data: Vec<i64>,
}

impl MetricsData {
    /// Append one metric's samples, keeping the arrays in step.
    pub fn push(
        &mut self,
        name: &str,
        object: ObjectRef,
        unit: &str,
        scale: u32,
        sequence_number: u32,
        samples: impl IntoIterator<Item = i64>,
    ) {
        let start = self.data.len();
        self.data.extend(samples);
        let len = self.data.len() - start;

        self.names.push(name.to_string());
        self.objects.push(object);
        self.units.push(unit.to_string());
        self.scales.push(scale);
        self.sequence_numbers.push(sequence_number);
        self.data_indices.push(start as u32);
        self.data_lengths.push(len as u32);
    }

    /// Number of metrics (N).
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if no metric is present.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_keeps_arrays_in_step() {
        let obj = ObjectRef::new(1, 1, 1);
        let mut d = MetricsData::default();
        d.push("CPU/Load/User", obj, "%", 1000, 3, [1500, 2500]);
        d.push("RAM/Usage/Used", obj, "kB", 1, 1, []);
        d.push("RAM/Usage/Free", obj, "kB", 1, 7, [42]);

        assert_eq!(d.len(), 3);
        assert_eq!(d.data_indices, vec![0, 2, 2]);
        assert_eq!(d.data_lengths, vec![2, 0, 1]);
        assert_eq!(d.data, vec![1500, 2500, 42]);
    }
}
