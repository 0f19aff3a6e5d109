//! Human-facing identifiers: registration IDs and farmer IDs.

use chrono::Utc;
use rand::Rng;

const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// `JG-<timestamp in base 36><4 random base 36 chars>`, upper case.
pub fn generate_registration_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("JG-{}{}", to_base36(millis), suffix)
}

pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// First three letters of an LGA or ward name, upper case.
pub fn area_code(name: &str) -> String {
    name.chars().take(3).collect::<String>().to_uppercase()
}

/// Farmer ID `LGA/WARD/AGENT/NUMBER`, e.g. `DUT/CHA/07/012`.
pub fn format_farmer_id(lga: &str, ward: &str, agent_serial: u32, counter: u64) -> String {
    format!(
        "{}/{}/{:02}/{:03}",
        area_code(lga),
        area_code(ward),
        agent_serial,
        counter
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FarmerIdParts {
    pub lga: String,
    pub ward: String,
    pub agent_serial: String,
    pub farmer_number: String,
}

pub fn parse_farmer_id(farmer_id: &str) -> Option<FarmerIdParts> {
    let parts: Vec<&str> = farmer_id.split('/').collect();
    if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(FarmerIdParts {
        lga: parts[0].to_string(),
        ward: parts[1].to_string(),
        agent_serial: parts[2].to_string(),
        farmer_number: parts[3].to_string(),
    })
}
