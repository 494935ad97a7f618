use serde_json::Value;

/// Trim an RFC 3339 timestamp to `2026-01-15T10:30:00` for table display.
pub fn short_timestamp(raw: &str) -> &str {
    if raw.len() >= 19 {
        &raw[..19]
    } else {
        raw
    }
}

fn str_of<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(|x| x.as_str()).unwrap_or("-")
}

fn f64_of(v: &Value, key: &str) -> f64 {
    v.get(key).and_then(|x| x.as_f64()).unwrap_or(0.0)
}

/// Render the offer table for `shopper inventory`.
pub fn render_offer_table(offers: &[Value]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<28} {:<12} {:<14} {:>5} {:>6} {:>9} {:<10} {:>6}\n",
        "OFFER", "PROVIDER", "GPU", "COUNT", "VRAM", "USD/H", "LOCATION", "CONF"
    ));
    out.push_str(&format!("{}\n", "-".repeat(98)));
    for offer in offers {
        out.push_str(&format!(
            "{:<28} {:<12} {:<14} {:>5} {:>5}G {:>9.4} {:<10} {:>6.2}\n",
            str_of(offer, "id"),
            str_of(offer, "provider"),
            str_of(offer, "gpu_model"),
            offer["gpu_count"].as_u64().unwrap_or(0),
            offer["vram_gb"].as_u64().unwrap_or(0),
            f64_of(offer, "price_per_hour"),
            str_of(offer, "location"),
            offer["availability_confidence"].as_f64().unwrap_or(1.0),
        ));
    }
    out
}

/// Render the session table for `shopper list`.
pub fn render_session_table(sessions: &[Value]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<38} {:<13} {:<12} {:<14} {:>9} {:<20}\n",
        "SESSION", "STATUS", "PROVIDER", "GPU", "USD/H", "CREATED"
    ));
    out.push_str(&format!("{}\n", "-".repeat(110)));
    for session in sessions {
        out.push_str(&format!(
            "{:<38} {:<13} {:<12} {:<14} {:>9.4} {:<20}\n",
            str_of(session, "id"),
            str_of(session, "status"),
            str_of(session, "provider"),
            str_of(session, "gpu_type"),
            f64_of(session, "price_per_hour"),
            short_timestamp(str_of(session, "created_at")),
        ));
    }
    out
}

/// Render one session in detail for `shopper get`.
pub fn render_session_detail(session: &Value) -> String {
    let mut out = String::new();
    out.push_str(&format!("Session:   {}\n", str_of(session, "id")));
    out.push_str(&format!("Consumer:  {}\n", str_of(session, "consumer_id")));
    out.push_str(&format!("Status:    {}\n", str_of(session, "status")));
    if let Some(error) = session.get("error").and_then(|e| e.as_str()) {
        out.push_str(&format!("Error:     {}\n", error));
    }
    out.push_str(&format!(
        "Offer:     {} ({} x{}, {:.4} USD/h)\n",
        str_of(session, "offer_id"),
        str_of(session, "gpu_type"),
        session["gpu_count"].as_u64().unwrap_or(0),
        f64_of(session, "price_per_hour"),
    ));
    out.push_str(&format!(
        "Provider:  {} instance={}\n",
        str_of(session, "provider"),
        str_of(session, "provider_instance_id"),
    ));

    let host = str_of(session, "ssh_host");
    if !host.is_empty() && host != "-" {
        out.push_str(&format!(
            "SSH:       ssh -p {} {}@{}\n",
            session["ssh_port"].as_u64().unwrap_or(0),
            str_of(session, "ssh_user"),
            host,
        ));
    }
    if let Some(endpoint) = session.get("api_endpoint").filter(|e| !e.is_null()) {
        out.push_str(&format!(
            "Endpoint:  http://{}:{}\n",
            str_of(endpoint, "host"),
            endpoint["port"].as_u64().unwrap_or(0),
        ));
    }
    out.push_str(&format!(
        "Created:   {}\n",
        short_timestamp(str_of(session, "created_at"))
    ));
    out.push_str(&format!(
        "Expires:   {}\n",
        short_timestamp(str_of(session, "expires_at"))
    ));

    let failed = str_of(session, "failed_offers");
    if !failed.is_empty() && failed != "-" {
        out.push_str(&format!("Failed offers: {}\n", failed));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamps_are_trimmed_for_display() {
        assert_eq!(short_timestamp("2026-01-15T10:30:00.123456Z"), "2026-01-15T10:30:00");
        assert_eq!(short_timestamp("short"), "short");
    }

    #[test]
    fn offer_table_includes_ids_and_prices() {
        let offers = vec![json!({
            "id": "vastai-42",
            "provider": "vastai",
            "gpu_model": "RTX 4090",
            "gpu_count": 1,
            "vram_gb": 24,
            "price_per_hour": 0.45,
            "location": "US",
            "availability_confidence": 0.85
        })];
        let table = render_offer_table(&offers);
        assert!(table.contains("vastai-42"));
        assert!(table.contains("RTX 4090"));
        assert!(table.contains("0.4500"));
    }

    #[test]
    fn session_detail_renders_ssh_command() {
        let session = json!({
            "id": "s1",
            "consumer_id": "cli",
            "status": "running",
            "offer_id": "vastai-42",
            "gpu_type": "RTX 4090",
            "gpu_count": 1,
            "price_per_hour": 0.45,
            "provider": "vastai",
            "provider_instance_id": "9001",
            "ssh_host": "ssh4.vast.ai",
            "ssh_port": 40022,
            "ssh_user": "root",
            "created_at": "2026-01-15T10:30:00Z",
            "expires_at": "2026-01-15T12:30:00Z",
            "failed_offers": ""
        });
        let detail = render_session_detail(&session);
        assert!(detail.contains("ssh -p 40022 root@ssh4.vast.ai"));
        assert!(!detail.contains("Failed offers"));
    }
}
