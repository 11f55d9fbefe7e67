//! Profile-status document returned by the fulfillment API.
//!
//! The provider is loose with types (counters arrive as numbers or numeric
//! strings, ids as either), so every scalar is decoded leniently and unknown
//! fields are kept in `extra`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

const KB_PER_MB: u64 = 1024;
const KB_PER_GB: u64 = 1024 * 1024;

/// Number of activity-log / usage rows shown in a summary.
pub const SUMMARY_ROWS: usize = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileStatus {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub plan_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub plan_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub point_contact_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub plan_start_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub plan_end_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub total_days: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub remaining_days: Option<u64>,
    /// Kilobytes.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub total_traffic: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub remaining_traffic: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub used_traffic: Option<u64>,
    /// Daily high-speed allowance, kilobytes.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub high_flow_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub order_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vendor_order_id: Option<String>,
    /// Newest first.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub activity_logs: Vec<ActivityLog>,
    /// Oldest first.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub usage_info_list: Vec<UsageInfo>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLog {
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub record_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub eid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    /// `YYYYMMDD`.
    #[serde(default, deserialize_with = "lenient_string")]
    pub used_date: Option<String>,
    /// Kilobytes.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub usage_amt: Option<u64>,
}

impl ProfileStatus {
    pub fn latest_activity(&self) -> Option<&ActivityLog> {
        self.activity_logs.first()
    }

    /// EID reported by the most recent activity entry.
    pub fn eid(&self) -> Option<&str> {
        self.latest_activity()
            .and_then(|log| log.eid.as_deref())
            .filter(|eid| !eid.is_empty())
    }

    /// The last `n` usage rows.
    pub fn recent_usage(&self, n: usize) -> &[UsageInfo] {
        let start = self.usage_info_list.len().saturating_sub(n);
        &self.usage_info_list[start..]
    }

    /// Plain-text report for terminals and logs.
    pub fn summary(&self) -> String {
        let na = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());
        let days = |v: Option<u64>| v.map_or_else(|| "N/A".to_string(), |d| d.to_string());
        let traffic = |v: Option<u64>| format_traffic(v.unwrap_or(0));

        let mut out = String::new();
        let _ = writeln!(out, "Plan:        {}", na(&self.name));
        let _ = writeln!(out, "Status:      {}", na(&self.plan_status));
        let _ = writeln!(out, "Type:        {}", na(&self.point_contact_type));
        let _ = writeln!(out, "Start:       {}", na(&self.plan_start_time));
        let _ = writeln!(out, "End:         {}", na(&self.plan_end_time));
        let _ = writeln!(
            out,
            "Days:        {} remaining of {}",
            days(self.remaining_days),
            days(self.total_days)
        );
        let _ = writeln!(
            out,
            "Data:        {} remaining, {} used of {}",
            traffic(self.remaining_traffic),
            traffic(self.used_traffic),
            traffic(self.total_traffic)
        );
        let _ = writeln!(out, "High speed:  {}/day", traffic(self.high_flow_size));
        let _ = writeln!(out, "Order ID:    {}", na(&self.order_id));
        let _ = writeln!(out, "Vendor ID:   {}", na(&self.vendor_order_id));
        let _ = writeln!(out, "EID:         {}", self.eid().unwrap_or("N/A"));

        if !self.activity_logs.is_empty() {
            let _ = writeln!(out, "\nRecent activity:");
            for log in self.activity_logs.iter().take(SUMMARY_ROWS) {
                let _ = writeln!(out, "  {} - {}", na(&log.record_time), na(&log.status));
            }
        }

        let usage = self.recent_usage(SUMMARY_ROWS);
        if !usage.is_empty() {
            let _ = writeln!(out, "\nRecent usage:");
            for row in usage {
                let date = row.used_date.as_deref().map(format_usage_date).unwrap_or_default();
                let _ = writeln!(out, "  {date}: {}", traffic(row.usage_amt));
            }
        }
        out
    }
}

/// Human-readable size for a kilobyte counter.
pub fn format_traffic(kb: u64) -> String {
    if kb >= KB_PER_GB {
        format!("{:.2} GB", kb as f64 / KB_PER_GB as f64)
    } else if kb >= KB_PER_MB {
        format!("{:.2} MB", kb as f64 / KB_PER_MB as f64)
    } else {
        format!("{kb} KB")
    }
}

/// `20260129` -> `29/01/2026`; anything unparseable is returned unchanged.
pub fn format_usage_date(raw: &str) -> String {
    let input = time::macros::format_description!("[year][month][day]");
    let output = time::macros::format_description!("[day]/[month]/[year]");
    time::Date::parse(raw.trim(), input)
        .ok()
        .and_then(|d| d.format(output).ok())
        .unwrap_or_else(|| raw.to_string())
}

// ---------------------------------------------------------------------------
// Lenient decoders
// ---------------------------------------------------------------------------

fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64)),
        _ => None,
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn null_as_empty<'de, D, T>(d: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(d)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "name": "Japan 5GB / 7 days",
        "planStatus": "In use",
        "planType": 1,
        "pointContactType": "Daily",
        "planStartTime": "2026-01-27 10:00:00",
        "planEndTime": "2026-02-03 10:00:00",
        "totalDays": "7",
        "remainingDays": 5,
        "totalTraffic": 5242880,
        "remainingTraffic": "4194304",
        "usedTraffic": 1048576,
        "highFlowSize": 524288,
        "orderId": 99817,
        "vendorOrderId": "V-1",
        "activityLogs": [
            {"status": "Activated", "recordTime": "2026-01-27 10:01", "eid": "8904903200000000000000000000001"},
            {"status": "Installed", "recordTime": "2026-01-27 09:59", "eid": null}
        ],
        "usageInfoList": [
            {"usedDate": "20260127", "usageAmt": 100},
            {"usedDate": "20260128", "usageAmt": "2048"},
            {"usedDate": "20260129", "usageAmt": 1048576},
            {"usedDate": "20260130", "usageAmt": 0}
        ],
        "iccid": "8944500102198304826"
    }"#;

    #[test]
    fn decodes_loose_types() {
        let s: ProfileStatus = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(s.total_days, Some(7));
        assert_eq!(s.remaining_traffic, Some(4_194_304));
        assert_eq!(s.order_id.as_deref(), Some("99817"));
        assert_eq!(s.plan_type.as_deref(), Some("1"));
        assert_eq!(s.extra.get("iccid").and_then(Value::as_str), Some("8944500102198304826"));
        assert_eq!(s.eid(), Some("8904903200000000000000000000001"));
    }

    #[test]
    fn missing_fields_default() {
        let s: ProfileStatus = serde_json::from_str(r#"{"activityLogs": null}"#).unwrap();
        assert!(s.name.is_none());
        assert!(s.activity_logs.is_empty());
        assert!(s.latest_activity().is_none());
        assert!(s.summary().contains("N/A"));
    }

    #[test]
    fn traffic_units() {
        assert_eq!(format_traffic(512), "512 KB");
        assert_eq!(format_traffic(1536), "1.50 MB");
        assert_eq!(format_traffic(5 * 1024 * 1024), "5.00 GB");
    }

    #[test]
    fn usage_dates() {
        assert_eq!(format_usage_date("20260129"), "29/01/2026");
        assert_eq!(format_usage_date("yesterday"), "yesterday");
    }

    #[test]
    fn summary_uses_recent_rows() {
        let s: ProfileStatus = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(s.recent_usage(3).len(), 3);
        assert_eq!(s.recent_usage(3)[0].used_date.as_deref(), Some("20260128"));

        let text = s.summary();
        assert!(text.contains("4.00 GB remaining"));
        assert!(text.contains("28/01/2026: 2.00 MB"));
        assert!(!text.contains("27/01/2026"));
        assert!(text.contains("Activated"));
    }
}
