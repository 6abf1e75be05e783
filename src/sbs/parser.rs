use anyhow::{Context, Result};

/// SBS-1 transmission types (MSG,1 through MSG,8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionType {
    /// MSG,1: ES Identification and Category (callsign)
    EsIdentAndCategory = 1,
    /// MSG,2: ES Surface Position
    EsSurfacePos = 2,
    /// MSG,3: ES Airborne Position (altitude, lat/lon)
    EsAirbornePos = 3,
    /// MSG,4: ES Airborne Velocity (speed, track, vertical rate)
    EsAirborneVel = 4,
    /// MSG,5: Surveillance Alt (altitude only)
    SurveillanceAlt = 5,
    /// MSG,6: Surveillance ID (squawk)
    SurveillanceId = 6,
    /// MSG,7: Air To Air (altitude)
    AirToAir = 7,
    /// MSG,8: All Call Reply (no data)
    AllCallReply = 8,
}

impl TransmissionType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::EsIdentAndCategory),
            2 => Some(Self::EsSurfacePos),
            3 => Some(Self::EsAirbornePos),
            4 => Some(Self::EsAirborneVel),
            5 => Some(Self::SurveillanceAlt),
            6 => Some(Self::SurveillanceId),
            7 => Some(Self::AirToAir),
            8 => Some(Self::AllCallReply),
            _ => None,
        }
    }

    /// Conventional name, as shown in the message type distribution
    pub fn name(&self) -> &'static str {
        match self {
            Self::EsIdentAndCategory => "ES_IDENT_AND_CATEGORY",
            Self::EsSurfacePos => "ES_SURFACE_POS",
            Self::EsAirbornePos => "ES_AIRBORNE_POS",
            Self::EsAirborneVel => "ES_AIRBORNE_VEL",
            Self::SurveillanceAlt => "SURVEILLANCE_ALT",
            Self::SurveillanceId => "SURVEILLANCE_ID",
            Self::AirToAir => "AIR_TO_AIR",
            Self::AllCallReply => "ALL_CALL_REPLY",
        }
    }
}

/// Partial per-aircraft update parsed from one SBS CSV line.
///
/// Every field except the transmission type and the ICAO address is
/// optional; a field the line does not carry is `None` and must never
/// overwrite existing aircraft state.
#[derive(Debug, Clone)]
pub struct SbsMessage {
    /// Transmission type (1-8)
    pub transmission_type: TransmissionType,
    /// ICAO 24-bit address as the feed sends it (hex string, e.g. "AB1234")
    pub icao24: String,
    /// Database flight id (from the feeder, rarely populated)
    pub flight_id: Option<String>,
    /// Callsign (from MSG,1)
    pub callsign: Option<String>,
    /// Altitude in feet (from MSG,3,5,7)
    pub altitude: Option<i32>,
    /// Ground speed in knots (from MSG,4)
    pub ground_speed: Option<f64>,
    /// Track over ground in degrees (from MSG,4)
    pub track: Option<f64>,
    /// Latitude in WGS84 degrees (from MSG,3)
    pub lat: Option<f64>,
    /// Longitude in WGS84 degrees (from MSG,3)
    pub lon: Option<f64>,
    /// Vertical rate in feet/minute (from MSG,4)
    pub vertical_rate: Option<i32>,
    /// Squawk code (from MSG,6)
    pub squawk: Option<String>,
}

impl SbsMessage {
    /// Check if this message carries position data
    pub fn has_position(&self) -> bool {
        self.lat.is_some() && self.lon.is_some()
    }
}

/// Parse an SBS CSV line into an [`SbsMessage`].
///
/// SBS format: MSG,<transmission_type>,<session_id>,<aircraft_id>,<icao24>,
///             <flight_id>,<date_gen>,<time_gen>,<date_log>,<time_log>,
///             <callsign>,<altitude>,<ground_speed>,<track>,<latitude>,
///             <longitude>,<vertical_rate>,<squawk>,<alert>,<emergency>,
///             <spi>,<on_ground>
pub fn parse_sbs_line(line: &str) -> Result<SbsMessage> {
    let fields: Vec<&str> = line.split(',').collect();

    // Minimum: MSG,<type>,,,<icao24> = at least 5 fields
    if fields.len() < 5 {
        anyhow::bail!(
            "SBS message too short: expected at least 5 fields, got {}",
            fields.len()
        );
    }

    // Field 0: must be "MSG"
    if fields[0] != "MSG" {
        anyhow::bail!("SBS message must start with MSG, got '{}'", fields[0]);
    }

    // Field 1: transmission type (1-8)
    let type_num: u8 = fields[1]
        .parse()
        .with_context(|| format!("Invalid transmission type: '{}'", fields[1]))?;

    let transmission_type = TransmissionType::from_u8(type_num)
        .ok_or_else(|| anyhow::anyhow!("Unknown transmission type: {}", type_num))?;

    // Fields 2-3: session ID and aircraft ID (unused)

    // Field 4: ICAO address (required, hex string)
    let icao24 = fields[4].to_string();
    if icao24.is_empty() {
        anyhow::bail!("ICAO address is required");
    }

    // Field 5: flight ID (optional)
    let flight_id = parse_optional_string(fields.get(5).copied());

    // Fields 6-9: generated/logged date and time (we timestamp on arrival)

    // Field 10: callsign (optional, padded with spaces)
    let callsign = parse_optional_string(fields.get(10).copied())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    // Field 11: altitude (optional, feet)
    let altitude = parse_optional_i32(fields.get(11).copied());

    // Field 12: ground speed (optional, knots)
    let ground_speed = parse_optional_f64(fields.get(12).copied());

    // Field 13: track (optional, degrees)
    let track = parse_optional_f64(fields.get(13).copied());

    // Field 14: latitude (optional)
    let lat = parse_optional_f64(fields.get(14).copied());

    // Field 15: longitude (optional)
    let lon = parse_optional_f64(fields.get(15).copied());

    // Field 16: vertical rate (optional, feet/min)
    let vertical_rate = parse_optional_i32(fields.get(16).copied());

    // Field 17: squawk (optional)
    let squawk = parse_optional_string(fields.get(17).copied()).filter(|s| !s.is_empty());

    // Fields 18-21: alert/emergency/SPI/on-ground flags (unused)

    Ok(SbsMessage {
        transmission_type,
        icao24,
        flight_id,
        callsign,
        altitude,
        ground_speed,
        track,
        lat,
        lon,
        vertical_rate,
        squawk,
    })
}

fn parse_optional_string(field: Option<&str>) -> Option<String> {
    field.filter(|s| !s.is_empty()).map(|s| s.to_string())
}

fn parse_optional_i32(field: Option<&str>) -> Option<i32> {
    field.filter(|s| !s.is_empty()).and_then(|s| s.parse().ok())
}

fn parse_optional_f64(field: Option<&str>) -> Option<f64> {
    field.filter(|s| !s.is_empty()).and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_msg_1_identification() {
        let line = "MSG,1,1,1,738065,1,2008/11/28,23:48:18.611,2008/11/28,23:53:19.161,RYR1427,,,,,,,0,,0,0";
        let msg = parse_sbs_line(line).unwrap();

        assert_eq!(msg.transmission_type, TransmissionType::EsIdentAndCategory);
        assert_eq!(msg.icao24, "738065");
        assert_eq!(msg.callsign, Some("RYR1427".to_string()));
        assert!(msg.altitude.is_none());
        assert!(msg.lat.is_none());
    }

    #[test]
    fn test_parse_msg_3_position() {
        let line = "MSG,3,1,1,738065,1,2008/11/28,23:48:18.611,2008/11/28,23:53:19.161,,36000,,,51.45735,1.02826,,,0,0,0,0";
        let msg = parse_sbs_line(line).unwrap();

        assert_eq!(msg.transmission_type, TransmissionType::EsAirbornePos);
        assert_eq!(msg.altitude, Some(36000));
        assert!((msg.lat.unwrap() - 51.45735).abs() < 0.0001);
        assert!((msg.lon.unwrap() - 1.02826).abs() < 0.0001);
        assert!(msg.has_position());
    }

    #[test]
    fn test_parse_msg_4_velocity() {
        let line = "MSG,4,1,1,738065,1,2008/11/28,23:48:18.611,2008/11/28,23:53:19.161,,,420,179,,,-640,,0,0,0,0";
        let msg = parse_sbs_line(line).unwrap();

        assert_eq!(msg.transmission_type, TransmissionType::EsAirborneVel);
        assert_eq!(msg.ground_speed, Some(420.0));
        assert_eq!(msg.track, Some(179.0));
        assert_eq!(msg.vertical_rate, Some(-640));
        assert!(!msg.has_position());
    }

    #[test]
    fn test_parse_msg_6_squawk() {
        let line = "MSG,6,1,1,738065,1,2008/11/28,23:48:18.611,2008/11/28,23:53:19.161,,,,,,,,7541,0,0,0,0";
        let msg = parse_sbs_line(line).unwrap();

        assert_eq!(msg.transmission_type, TransmissionType::SurveillanceId);
        assert_eq!(msg.squawk, Some("7541".to_string()));
    }

    #[test]
    fn test_callsign_is_trimmed() {
        let line = "MSG,1,1,1,738065,1,2008/11/28,23:48:18.611,2008/11/28,23:53:19.161,ABC     ,,,,,,,0,,0,0";
        let msg = parse_sbs_line(line).unwrap();
        assert_eq!(msg.callsign, Some("ABC".to_string()));
    }

    #[test]
    fn test_parse_short_format() {
        // Some SBS implementations send shorter messages
        let line = "MSG,3,,,AB1234,,,,,,,5000,,,51.5074,-0.1278,,,0,0,0,0";
        let msg = parse_sbs_line(line).unwrap();

        assert_eq!(msg.icao24, "AB1234");
        assert_eq!(msg.altitude, Some(5000));
        assert!(msg.has_position());
    }

    #[test]
    fn test_empty_fields_are_none() {
        let line = "MSG,8,,,AB1234,,,,,,,,,,,,,,,,,";
        let msg = parse_sbs_line(line).unwrap();

        assert_eq!(msg.transmission_type, TransmissionType::AllCallReply);
        assert!(msg.callsign.is_none());
        assert!(msg.altitude.is_none());
        assert!(msg.ground_speed.is_none());
        assert!(msg.squawk.is_none());
    }

    #[test]
    fn test_invalid_transmission_type() {
        let line = "MSG,9,,,AB1234,,,,,,,5000,,,51.5074,-0.1278,,,0,0,0,0";
        assert!(parse_sbs_line(line).is_err());
    }

    #[test]
    fn test_non_msg_prefix() {
        let line = "STA,3,,,AB1234,,,,,,,5000,,,51.5074,-0.1278,,,0,0,0,0";
        assert!(parse_sbs_line(line).is_err());
    }

    #[test]
    fn test_empty_icao_address() {
        let line = "MSG,3,,,,,,,,,,5000,,,51.5074,-0.1278,,,0,0,0,0";
        assert!(parse_sbs_line(line).is_err());
    }

    #[test]
    fn test_unparseable_numeric_field_is_none() {
        let line = "MSG,3,,,AB1234,,,,,,,alt?,,,51.5074,-0.1278,,,0,0,0,0";
        let msg = parse_sbs_line(line).unwrap();
        assert!(msg.altitude.is_none());
        assert!(msg.has_position());
    }
}
