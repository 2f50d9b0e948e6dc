//! Prometheus exposition built from aggregator snapshots.
//!
//! Gauges are re-populated on every scrape rather than updated on the hot
//! path; the aggregator already keeps the numbers, the registry only mirrors
//! the latest snapshot.

use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use catchmole_stats::{ClientStats, GlobalStats};

#[derive(Clone)]
pub struct MetricsRecorder {
    registry: Registry,

    global_download_bytes: IntGauge,
    global_upload_bytes: IntGauge,
    global_download_speed: IntGauge,
    global_upload_speed: IntGauge,
    global_active_connections: IntGauge,

    client_download_bytes: IntGaugeVec,
    client_upload_bytes: IntGaugeVec,
    client_download_speed: IntGaugeVec,
    client_upload_speed: IntGaugeVec,
    client_active_connections: IntGaugeVec,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let registry = Registry::new();

        let global_download_bytes = IntGauge::new(
            "catchmole_global_download_bytes_total",
            "WAN-attributed download bytes since start or reset",
        )
        .unwrap();
        let global_upload_bytes = IntGauge::new(
            "catchmole_global_upload_bytes_total",
            "WAN-attributed upload bytes since start or reset",
        )
        .unwrap();
        let global_download_speed = IntGauge::new(
            "catchmole_global_download_speed_bytes",
            "Sum of per-client download speeds in bytes per second",
        )
        .unwrap();
        let global_upload_speed = IntGauge::new(
            "catchmole_global_upload_speed_bytes",
            "Sum of per-client upload speeds in bytes per second",
        )
        .unwrap();
        let global_active_connections = IntGauge::new(
            "catchmole_global_active_connections",
            "Smoothed count of live flows",
        )
        .unwrap();

        let labels = &["mac", "name"];
        let client_download_bytes = IntGaugeVec::new(
            Opts::new(
                "catchmole_client_download_bytes_total",
                "Download bytes attributed to the client",
            ),
            labels,
        )
        .unwrap();
        let client_upload_bytes = IntGaugeVec::new(
            Opts::new(
                "catchmole_client_upload_bytes_total",
                "Upload bytes attributed to the client",
            ),
            labels,
        )
        .unwrap();
        let client_download_speed = IntGaugeVec::new(
            Opts::new(
                "catchmole_client_download_speed_bytes",
                "Client download speed in bytes per second",
            ),
            labels,
        )
        .unwrap();
        let client_upload_speed = IntGaugeVec::new(
            Opts::new(
                "catchmole_client_upload_speed_bytes",
                "Client upload speed in bytes per second",
            ),
            labels,
        )
        .unwrap();
        let client_active_connections = IntGaugeVec::new(
            Opts::new(
                "catchmole_client_active_connections",
                "Smoothed count of the client's live flows",
            ),
            labels,
        )
        .unwrap();

        registry.register(Box::new(global_download_bytes.clone())).unwrap();
        registry.register(Box::new(global_upload_bytes.clone())).unwrap();
        registry.register(Box::new(global_download_speed.clone())).unwrap();
        registry.register(Box::new(global_upload_speed.clone())).unwrap();
        registry
            .register(Box::new(global_active_connections.clone()))
            .unwrap();
        registry.register(Box::new(client_download_bytes.clone())).unwrap();
        registry.register(Box::new(client_upload_bytes.clone())).unwrap();
        registry.register(Box::new(client_download_speed.clone())).unwrap();
        registry.register(Box::new(client_upload_speed.clone())).unwrap();
        registry
            .register(Box::new(client_active_connections.clone()))
            .unwrap();

        Self {
            registry,
            global_download_bytes,
            global_upload_bytes,
            global_download_speed,
            global_upload_speed,
            global_active_connections,
            client_download_bytes,
            client_upload_bytes,
            client_download_speed,
            client_upload_speed,
            client_active_connections,
        }
    }

    /// Fills the gauges from a snapshot and renders the exposition text.
    pub fn render(
        &self,
        global: &GlobalStats,
        clients: &[ClientStats],
    ) -> Result<String, prometheus::Error> {
        self.global_download_bytes.set(clamp(global.total_download));
        self.global_upload_bytes.set(clamp(global.total_upload));
        self.global_download_speed.set(clamp(global.download_speed));
        self.global_upload_speed.set(clamp(global.upload_speed));
        self.global_active_connections
            .set(clamp(global.active_connections));

        // Drop label sets for clients that were reset away.
        self.client_download_bytes.reset();
        self.client_upload_bytes.reset();
        self.client_download_speed.reset();
        self.client_upload_speed.reset();
        self.client_active_connections.reset();

        for client in clients {
            let labels = &[client.mac.as_str(), client.name.as_str()];
            self.client_download_bytes
                .with_label_values(labels)
                .set(clamp(client.total_download));
            self.client_upload_bytes
                .with_label_values(labels)
                .set(clamp(client.total_upload));
            self.client_download_speed
                .with_label_values(labels)
                .set(clamp(client.download_speed));
            self.client_upload_speed
                .with_label_values(labels)
                .set(clamp(client.upload_speed));
            self.client_active_connections
                .with_label_values(labels)
                .set(clamp(client.active_connections));
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

fn clamp(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn client(mac: &str, name: &str, download: u64, upload: u64) -> ClientStats {
        let mut client = ClientStats::new(mac.to_string(), name.to_string(), Utc::now());
        client.total_download = download;
        client.total_upload = upload;
        client.active_connections = 3;
        client
    }

    #[test]
    fn renders_global_and_client_series() {
        let recorder = MetricsRecorder::new();
        let global = GlobalStats {
            total_download: 123,
            total_upload: 456,
            download_speed: 10,
            upload_speed: 20,
            active_connections: 7,
        };
        let clients = vec![client("aa:bb:cc:dd:ee:ff", "laptop", 123, 456)];

        let output = recorder.render(&global, &clients).unwrap();
        assert!(output.contains("catchmole_global_download_bytes_total 123"));
        assert!(output.contains("catchmole_global_active_connections 7"));
        assert!(output.contains(
            r#"catchmole_client_upload_bytes_total{mac="aa:bb:cc:dd:ee:ff",name="laptop"} 456"#
        ));
    }

    #[test]
    fn reset_clients_disappear_from_output() {
        let recorder = MetricsRecorder::new();
        let global = GlobalStats::default();
        let output = recorder
            .render(&global, &[client("aa:bb:cc:dd:ee:ff", "laptop", 1, 1)])
            .unwrap();
        assert!(output.contains("laptop"));

        let output = recorder.render(&global, &[]).unwrap();
        assert!(!output.contains("laptop"));
    }
}
