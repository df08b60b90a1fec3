//! Performance metrics.
//!
//! The server returns query results as parallel arrays over one shared
//! sample buffer. [`decode`] turns that into [`MetricSamples`] records right
//! at the boundary; nothing else in the crate sees the flattened shape.

use crate::error::{Error, Result};
use crate::objects::RemoteObject;
use tracing::debug;
use vboxctl_protocol::{ApiRequest, MetricDescriptor, MetricsData, ObjectRef};

/// Samples of one metric on one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSamples {
    pub name: String,
    pub object: ObjectRef,
    pub unit: String,
    pub scale: u32,
    pub sequence_number: u32,
    /// Raw, unscaled values, oldest first.
    pub samples: Vec<i64>,
}

impl MetricSamples {
    /// Display strings for every sample.
    pub fn formatted(&self) -> Vec<String> {
        self.samples
            .iter()
            .map(|raw| format_sample(*raw, self.scale, &self.unit))
            .collect()
    }
}

/// Render a raw sample for display.
///
/// Scale 1 prints the raw integer; any other scale divides by it.
pub fn format_sample(raw: i64, scale: u32, unit: &str) -> String {
    if scale == 1 {
        format!("{}{}", raw, unit)
    } else {
        format!("{:.2}{}", raw as f64 / f64::from(scale), unit)
    }
}

/// Decode a flattened query result.
pub fn decode(data: MetricsData) -> Result<Vec<MetricSamples>> {
    let n = data.names.len();
    let lengths = [
        ("objects", data.objects.len()),
        ("units", data.units.len()),
        ("scales", data.scales.len()),
        ("sequence_numbers", data.sequence_numbers.len()),
        ("data_indices", data.data_indices.len()),
        ("data_lengths", data.data_lengths.len()),
    ];
    for (field, len) in lengths {
        if len != n {
            return Err(Error::MalformedMetricsResponse(format!(
                "{} has {} entries, expected {}",
                field, len, n
            )));
        }
    }

    let total: u64 = data.data_lengths.iter().map(|l| u64::from(*l)).sum();
    if total != data.data.len() as u64 {
        return Err(Error::MalformedMetricsResponse(format!(
            "lengths sum to {} but {} samples were returned",
            total,
            data.data.len()
        )));
    }

    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let start = data.data_indices[i] as usize;
        let end = start + data.data_lengths[i] as usize;
        let Some(samples) = data.data.get(start..end) else {
            return Err(Error::MalformedMetricsResponse(format!(
                "{}: samples [{}..{}) exceed buffer of {}",
                data.names[i],
                start,
                end,
                data.data.len()
            )));
        };
        if data.scales[i] == 0 {
            return Err(Error::MalformedMetricsResponse(format!(
                "{}: zero scale",
                data.names[i]
            )));
        }
        out.push(MetricSamples {
            name: data.names[i].clone(),
            object: data.objects[i],
            unit: data.units[i].clone(),
            scale: data.scales[i],
            sequence_number: data.sequence_numbers[i],
            samples: samples.to_vec(),
        });
    }
    Ok(out)
}

/// Client of the server's performance collector.
#[derive(Debug)]
pub struct MetricsCollector {
    obj: RemoteObject,
    released: bool,
}

fn to_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

impl MetricsCollector {
    pub(crate) fn new(obj: RemoteObject) -> Self {
        Self {
            obj,
            released: false,
        }
    }

    pub fn handle(&self) -> ObjectRef {
        self.obj.handle()
    }

    /// (Re)configure `names` on `targets` with a ring buffer of `depth`
    /// samples taken every `period_secs`. Empty targets means all objects.
    pub fn setup(
        &self,
        names: &[&str],
        targets: &[ObjectRef],
        period_secs: u32,
        depth: u32,
    ) -> Result<Vec<MetricDescriptor>> {
        let descriptors: Vec<MetricDescriptor> = self.obj.invoke(ApiRequest::SetupMetrics {
            this: self.obj.handle(),
            names: to_names(names),
            objects: targets.to_vec(),
            period: period_secs,
            count: depth,
        })?;
        debug!(count = descriptors.len(), period_secs, depth, "metrics configured");
        Ok(descriptors)
    }

    /// Resume collection.
    pub fn enable(&self, names: &[&str], targets: &[ObjectRef]) -> Result<Vec<MetricDescriptor>> {
        self.obj.invoke(ApiRequest::EnableMetrics {
            this: self.obj.handle(),
            names: to_names(names),
            objects: targets.to_vec(),
        })
    }

    /// Pause collection, keeping the configuration.
    pub fn disable(&self, names: &[&str], targets: &[ObjectRef]) -> Result<Vec<MetricDescriptor>> {
        self.obj.invoke(ApiRequest::DisableMetrics {
            this: self.obj.handle(),
            names: to_names(names),
            objects: targets.to_vec(),
        })
    }

    /// Configured metrics.
    pub fn metrics(&self, names: &[&str], targets: &[ObjectRef]) -> Result<Vec<MetricDescriptor>> {
        self.obj.invoke(ApiRequest::GetMetrics {
            this: self.obj.handle(),
            names: to_names(names),
            objects: targets.to_vec(),
        })
    }

    /// Query and decode accumulated samples.
    pub fn query(&self, names: &[&str], targets: &[ObjectRef]) -> Result<Vec<MetricSamples>> {
        let data: MetricsData = self.obj.invoke(ApiRequest::QueryMetricsData {
            this: self.obj.handle(),
            names: to_names(names),
            objects: targets.to_vec(),
        })?;
        decode(data)
    }

    /// Release the collector reference. Repeated calls do nothing.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.obj.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Credentials, SessionManager};
    use crate::transport::testing::RecordingTransport;
    use crate::transport::{InProcessTransport, ReleasePolicy, Transport};
    use std::sync::Arc;
    use vboxctl_sim::Platform;

    fn wire() -> MetricsData {
        let a = ObjectRef::new(1, 1, 1);
        let b = ObjectRef::new(1, 2, 1);
        let mut data = MetricsData::default();
        data.push("CPU/Load/User", a, "%", 1000, 7, [12_500, 13_000].into_iter());
        data.push("RAM/Usage/Total", a, "kB", 1, 3, [2_048].into_iter());
        data.push("Guest/RAM/Usage/Free", b, "kB", 1, 0, std::iter::empty());
        data
    }

    #[test]
    fn test_decode_slices_shared_buffer() {
        let data = wire();
        let decoded = decode(data.clone()).unwrap();
        assert_eq!(decoded.len(), 3);

        let total: u32 = data.data_lengths.iter().sum();
        assert_eq!(total as usize, data.data.len());
        for (i, m) in decoded.iter().enumerate() {
            let start = data.data_indices[i] as usize;
            let end = start + data.data_lengths[i] as usize;
            assert_eq!(m.samples, data.data[start..end]);
            assert_eq!(m.name, data.names[i]);
        }
        assert_eq!(decoded[0].sequence_number, 7);
        assert!(decoded[2].samples.is_empty());
    }

    #[test]
    fn test_decode_rejects_out_of_range() {
        let mut data = wire();
        data.data_indices[1] = 2;
        data.data_lengths[1] = 5;
        data.data_lengths[0] = 0;
        data.data_lengths[2] = 0;
        data.data.truncate(5);
        assert!(matches!(decode(data), Err(Error::MalformedMetricsResponse(_))));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut data = wire();
        data.units.pop();
        assert!(matches!(decode(data), Err(Error::MalformedMetricsResponse(_))));

        let mut data = wire();
        data.data.push(99);
        assert!(matches!(decode(data), Err(Error::MalformedMetricsResponse(_))));
    }

    #[test]
    fn test_decode_rejects_zero_scale() {
        let mut data = wire();
        data.scales[0] = 0;
        assert!(matches!(decode(data), Err(Error::MalformedMetricsResponse(_))));
    }

    #[test]
    fn test_format_sample() {
        assert_eq!(format_sample(2048, 1, "kB"), "2048kB");
        assert_eq!(format_sample(-3, 1, ""), "-3");
        assert_eq!(format_sample(12_500, 1000, "%"), "12.50%");
        assert_eq!(format_sample(7, 2, "MHz"), "3.50MHz");

        let decoded = decode(wire()).unwrap();
        assert_eq!(decoded[0].formatted(), vec!["12.50%", "13.00%"]);
        assert_eq!(decoded[0].samples, vec![12_500, 13_000]);
        assert_eq!(decoded[1].formatted(), vec!["2048kB"]);
    }

    #[test]
    fn test_collector_round_trip() {
        let platform = Arc::new(Platform::demo());
        let mut mgr = SessionManager::new(Arc::new(InProcessTransport::new(platform)));
        let session = mgr.connect(&Credentials::default()).unwrap();
        let host = session.host().unwrap();
        let perf = session.performance_collector().unwrap();

        let descriptors = perf.setup(&["RAM/Usage/*"], &[host.handle()], 60, 4).unwrap();
        assert_eq!(descriptors.len(), 3);
        assert!(descriptors.iter().all(|d| d.period == 60 && d.count == 4));
        assert_eq!(perf.metrics(&["*"], &[]).unwrap().len(), 3);

        let samples = perf.query(&["RAM/Usage/Total"], &[host.handle()]).unwrap();
        let total_kb = host.info().unwrap().memory_size_mb as i64 * 1024;
        assert_eq!(samples[0].samples, vec![total_kb]);
        assert_eq!(samples[0].formatted(), vec![format!("{}kB", total_kb)]);

        assert_eq!(perf.disable(&["RAM/*"], &[]).unwrap().len(), 3);
        assert_eq!(perf.enable(&["RAM/Usage/Used"], &[]).unwrap().len(), 1);
    }

    #[test]
    fn test_release_idempotent() {
        let inner: Arc<dyn Transport> = Arc::new(
            InProcessTransport::new(Arc::new(Platform::demo()))
                .with_release_policy(ReleasePolicy::Explicit),
        );
        let recorder = Arc::new(RecordingTransport::new(inner));
        let mut mgr = SessionManager::new(recorder.clone());
        let session = mgr.connect(&Credentials::default()).unwrap();
        let mut perf = session.performance_collector().unwrap();

        perf.release().unwrap();
        perf.release().unwrap();
        assert_eq!(recorder.count("release"), 1);
    }
}
