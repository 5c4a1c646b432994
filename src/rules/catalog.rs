//! The built-in rule catalogue.
//!
//! Thresholds mirror production tuning for the Nigerian market; change them
//! together with the accuracy metrics, not in isolation.

use chrono::Timelike;

use super::{Rule, RuleContext};
use crate::models::{Severity, TransactionRecord, TransactionType, Vertical};

/// Straight-line speed above which two located transactions cannot belong to
/// the same traveller (km/h).
const MAX_TRAVEL_SPEED_KMH: f64 = 900.0;

/// Every built-in rule, ordered by id. Flag order in responses follows this.
pub fn default_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(HighVelocityDevice),
        Box::new(HighVelocityPhone),
        Box::new(UnusualAmount),
        Box::new(LateNight),
        Box::new(NewDevice),
        Box::new(LoanStacking),
        Box::new(VelocitySpike),
        Box::new(RoundAmount),
        Box::new(MultipleApplications),
        Box::new(DeviceHistoryFraud),
        Box::new(CardTesting),
        Box::new(ImpossibleTravel),
        Box::new(BonusAbuse),
        Box::new(CryptoRapidFlow),
        Box::new(NewSellerHighValue),
        Box::new(IpDeviceSpread),
    ]
}

pub struct HighVelocityDevice;

impl Rule for HighVelocityDevice {
    fn id(&self) -> u32 {
        1
    }
    fn name(&self) -> &'static str {
        "HighVelocityDevice"
    }
    fn base_score(&self) -> f64 {
        15.0
    }
    fn severity(&self) -> Severity {
        Severity::High
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        if !tx.device_hash.is_empty() && ctx.device_velocity.count_1h > 10 {
            Some(format!(
                "device seen {} times in the last hour",
                ctx.device_velocity.count_1h
            ))
        } else {
            None
        }
    }
}

pub struct HighVelocityPhone;

impl Rule for HighVelocityPhone {
    fn id(&self) -> u32 {
        2
    }
    fn name(&self) -> &'static str {
        "HighVelocityPhone"
    }
    fn base_score(&self) -> f64 {
        15.0
    }
    fn severity(&self) -> Severity {
        Severity::High
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        if !tx.phone_hash.is_empty() && ctx.phone_velocity.count_1h > 5 {
            Some(format!(
                "phone seen {} times in the last hour",
                ctx.phone_velocity.count_1h
            ))
        } else {
            None
        }
    }
}

pub struct UnusualAmount;

impl Rule for UnusualAmount {
    fn id(&self) -> u32 {
        3
    }
    fn name(&self) -> &'static str {
        "UnusualAmount"
    }
    fn base_score(&self) -> f64 {
        10.0
    }
    fn severity(&self) -> Severity {
        Severity::Medium
    }
    fn check(&self, tx: &TransactionRecord, _ctx: &RuleContext) -> Option<String> {
        if tx.amount > 1_000_000.0 {
            return Some(format!("amount {:.2} above expected band", tx.amount));
        }
        if tx.transaction_type == TransactionType::LoanApplication && tx.amount < 100.0 {
            return Some(format!(
                "loan application for implausibly small amount {:.2}",
                tx.amount
            ));
        }
        None
    }
}

pub struct LateNight;

impl Rule for LateNight {
    fn id(&self) -> u32 {
        4
    }
    fn name(&self) -> &'static str {
        "LateNight"
    }
    fn base_score(&self) -> f64 {
        5.0
    }
    fn severity(&self) -> Severity {
        Severity::Low
    }
    fn check(&self, _tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        let hour = ctx.now.hour();
        if (2..=5).contains(&hour) {
            Some(format!("transaction at {:02}:00, inside the 02-05 window", hour))
        } else {
            None
        }
    }
}

pub struct NewDevice;

impl Rule for NewDevice {
    fn id(&self) -> u32 {
        5
    }
    fn name(&self) -> &'static str {
        "NewDevice"
    }
    fn base_score(&self) -> f64 {
        8.0
    }
    fn severity(&self) -> Severity {
        Severity::Medium
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        if !tx.device_hash.is_empty()
            && ctx.device_history.is_empty()
            && tx.amount > 50_000.0
        {
            Some(format!(
                "first transaction from this device for {:.2}",
                tx.amount
            ))
        } else {
            None
        }
    }
}

pub struct LoanStacking;

impl Rule for LoanStacking {
    fn id(&self) -> u32 {
        6
    }
    fn name(&self) -> &'static str {
        "LoanStacking"
    }
    fn base_score(&self) -> f64 {
        20.0
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }
    fn verticals(&self) -> &'static [Vertical] {
        &[Vertical::Fintech]
    }
    fn transaction_types(&self) -> &'static [TransactionType] {
        &[TransactionType::LoanApplication]
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        if !tx.phone_hash.is_empty() && ctx.phone_velocity.count_24h >= 3 {
            Some(format!(
                "{} loan-related events for this phone in 24h",
                ctx.phone_velocity.count_24h
            ))
        } else {
            None
        }
    }
}

pub struct VelocitySpike;

impl Rule for VelocitySpike {
    fn id(&self) -> u32 {
        7
    }
    fn name(&self) -> &'static str {
        "VelocitySpike"
    }
    fn base_score(&self) -> f64 {
        12.0
    }
    fn severity(&self) -> Severity {
        Severity::High
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        if !tx.device_hash.is_empty() && ctx.device_velocity.count_10m >= 3 {
            Some(format!(
                "{} transactions from this device in 10 minutes",
                ctx.device_velocity.count_10m
            ))
        } else {
            None
        }
    }
}

pub struct RoundAmount;

impl Rule for RoundAmount {
    fn id(&self) -> u32 {
        8
    }
    fn name(&self) -> &'static str {
        "RoundAmount"
    }
    fn base_score(&self) -> f64 {
        5.0
    }
    fn severity(&self) -> Severity {
        Severity::Low
    }
    fn check(&self, tx: &TransactionRecord, _ctx: &RuleContext) -> Option<String> {
        if tx.amount >= 100_000.0 && tx.amount.rem_euclid(10_000.0) < 1e-9 {
            Some(format!("round amount {:.0}", tx.amount))
        } else {
            None
        }
    }
}

pub struct MultipleApplications;

impl Rule for MultipleApplications {
    fn id(&self) -> u32 {
        9
    }
    fn name(&self) -> &'static str {
        "MultipleApplications"
    }
    fn base_score(&self) -> f64 {
        18.0
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }
    fn verticals(&self) -> &'static [Vertical] {
        &[Vertical::Fintech]
    }
    fn transaction_types(&self) -> &'static [TransactionType] {
        &[TransactionType::LoanApplication]
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        if !tx.bvn_hash.is_empty()
            && !tx.phone_hash.is_empty()
            && ctx.phone_velocity.count_1h >= 2
        {
            Some(format!(
                "{} applications for this phone within the hour",
                ctx.phone_velocity.count_1h
            ))
        } else {
            None
        }
    }
}

pub struct DeviceHistoryFraud;

impl Rule for DeviceHistoryFraud {
    fn id(&self) -> u32 {
        10
    }
    fn name(&self) -> &'static str {
        "DeviceHistoryFraud"
    }
    fn base_score(&self) -> f64 {
        15.0
    }
    fn severity(&self) -> Severity {
        Severity::High
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        let history = &ctx.device_history;
        if !tx.device_hash.is_empty() && !history.is_empty() && history.fraud_ratio() > 0.5 {
            Some(format!(
                "{} of {} prior transactions from this device were fraud",
                history.fraud_count(),
                history.count()
            ))
        } else {
            None
        }
    }
}

pub struct CardTesting;

impl Rule for CardTesting {
    fn id(&self) -> u32 {
        11
    }
    fn name(&self) -> &'static str {
        "CardTesting"
    }
    fn base_score(&self) -> f64 {
        15.0
    }
    fn severity(&self) -> Severity {
        Severity::High
    }
    fn transaction_types(&self) -> &'static [TransactionType] {
        &[TransactionType::Purchase]
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        if !tx.device_hash.is_empty()
            && ctx.device_velocity.count_10m >= 5
            && tx.amount < 1_000.0
        {
            Some(format!(
                "{} small purchases from this device in 10 minutes",
                ctx.device_velocity.count_10m
            ))
        } else {
            None
        }
    }
}

pub struct ImpossibleTravel;

impl Rule for ImpossibleTravel {
    fn id(&self) -> u32 {
        12
    }
    fn name(&self) -> &'static str {
        "ImpossibleTravel"
    }
    fn base_score(&self) -> f64 {
        50.0
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        let here = tx.location.as_ref()?;
        let prior = ctx.device_history.last_located()?;
        let there = prior.location.as_ref()?;

        let distance_km = haversine_km(here.lat, here.lon, there.lat, there.lon);
        // Sub-second gaps floor at one second to keep the ratio finite.
        let elapsed_hours = (ctx.now - prior.created_at)
            .num_seconds()
            .max(1) as f64
            / 3_600.0;
        let speed = distance_km / elapsed_hours;
        if speed > MAX_TRAVEL_SPEED_KMH {
            Some(format!(
                "{:.0} km in {:.2}h implies {:.0} km/h",
                distance_km, elapsed_hours, speed
            ))
        } else {
            None
        }
    }
}

pub struct BonusAbuse;

impl Rule for BonusAbuse {
    fn id(&self) -> u32 {
        13
    }
    fn name(&self) -> &'static str {
        "BonusAbuse"
    }
    fn base_score(&self) -> f64 {
        10.0
    }
    fn severity(&self) -> Severity {
        Severity::Medium
    }
    fn verticals(&self) -> &'static [Vertical] {
        &[Vertical::Betting]
    }
    fn transaction_types(&self) -> &'static [TransactionType] {
        &[TransactionType::BetPlacement]
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        if !tx.device_hash.is_empty() && ctx.device_history.is_empty() {
            Some("first bet from an unseen device".to_string())
        } else {
            None
        }
    }
}

pub struct CryptoRapidFlow;

impl Rule for CryptoRapidFlow {
    fn id(&self) -> u32 {
        14
    }
    fn name(&self) -> &'static str {
        "CryptoRapidFlow"
    }
    fn base_score(&self) -> f64 {
        12.0
    }
    fn severity(&self) -> Severity {
        Severity::High
    }
    fn verticals(&self) -> &'static [Vertical] {
        &[Vertical::Crypto]
    }
    fn transaction_types(&self) -> &'static [TransactionType] {
        &[
            TransactionType::CryptoDeposit,
            TransactionType::CryptoWithdrawal,
        ]
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        if !tx.device_hash.is_empty() && ctx.device_velocity.count_1h >= 5 {
            Some(format!(
                "{} crypto movements from this device in an hour",
                ctx.device_velocity.count_1h
            ))
        } else {
            None
        }
    }
}

pub struct NewSellerHighValue;

impl Rule for NewSellerHighValue {
    fn id(&self) -> u32 {
        15
    }
    fn name(&self) -> &'static str {
        "NewSellerHighValue"
    }
    fn base_score(&self) -> f64 {
        15.0
    }
    fn severity(&self) -> Severity {
        Severity::High
    }
    fn verticals(&self) -> &'static [Vertical] {
        &[Vertical::Marketplace]
    }
    fn transaction_types(&self) -> &'static [TransactionType] {
        &[TransactionType::MarketplaceListing]
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        if !tx.device_hash.is_empty()
            && ctx.device_history.is_empty()
            && tx.amount > 100_000.0
        {
            Some(format!(
                "new seller listing at {:.2} with no device history",
                tx.amount
            ))
        } else {
            None
        }
    }
}

pub struct IpDeviceSpread;

impl Rule for IpDeviceSpread {
    fn id(&self) -> u32 {
        16
    }
    fn name(&self) -> &'static str {
        "IpDeviceSpread"
    }
    fn base_score(&self) -> f64 {
        12.0
    }
    fn severity(&self) -> Severity {
        Severity::High
    }
    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String> {
        if !tx.ip_address.is_empty() && ctx.ip_device_count >= 3 {
            Some(format!(
                "{} distinct devices behind {} in 24h",
                ctx.ip_device_count, tx.ip_address
            ))
        } else {
            None
        }
    }
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6_371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Location;
    use crate::rules::testutil::{no_device, record};
    use crate::store::{DeviceHistory, DeviceHistoryEntry};
    use chrono::{Duration, TimeZone, Utc};

    fn ctx() -> RuleContext {
        RuleContext::empty(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap())
    }

    fn history(entries: Vec<DeviceHistoryEntry>) -> DeviceHistory {
        DeviceHistory { entries }
    }

    fn entry(amount: f64, fraud: Option<bool>) -> DeviceHistoryEntry {
        DeviceHistoryEntry {
            amount,
            actual_fraud: fraud,
            created_at: Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
            location: None,
        }
    }

    #[test]
    fn high_velocity_device_threshold() {
        let tx = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        let mut c = ctx();
        c.device_velocity.count_1h = 10;
        assert!(HighVelocityDevice.check(&tx, &c).is_none());
        c.device_velocity.count_1h = 11;
        assert!(HighVelocityDevice.check(&tx, &c).is_some());
        // No device, no flag.
        assert!(HighVelocityDevice.check(&no_device(tx), &c).is_none());
    }

    #[test]
    fn high_velocity_phone_threshold() {
        let tx = record(TransactionType::Transfer, Vertical::Fintech, 500.0);
        let mut c = ctx();
        c.phone_velocity.count_1h = 5;
        assert!(HighVelocityPhone.check(&tx, &c).is_none());
        c.phone_velocity.count_1h = 6;
        assert!(HighVelocityPhone.check(&tx, &c).is_some());
    }

    #[test]
    fn unusual_amount_both_arms() {
        let c = ctx();
        let big = record(TransactionType::Transfer, Vertical::Fintech, 1_000_001.0);
        assert!(UnusualAmount.check(&big, &c).is_some());

        let tiny_loan = record(TransactionType::LoanApplication, Vertical::Fintech, 50.0);
        assert!(UnusualAmount.check(&tiny_loan, &c).is_some());

        let tiny_purchase = record(TransactionType::Purchase, Vertical::Fintech, 50.0);
        assert!(UnusualAmount.check(&tiny_purchase, &c).is_none());

        let normal = record(TransactionType::Transfer, Vertical::Fintech, 999_999.0);
        assert!(UnusualAmount.check(&normal, &c).is_none());
    }

    #[test]
    fn late_night_window_is_inclusive() {
        let tx = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        for (hour, fires) in [(1, false), (2, true), (4, true), (5, true), (6, false)] {
            let mut c = ctx();
            c.now = Utc.with_ymd_and_hms(2024, 6, 1, hour, 30, 0).unwrap();
            assert_eq!(LateNight.check(&tx, &c).is_some(), fires, "hour {}", hour);
        }
    }

    #[test]
    fn new_device_needs_amount_and_empty_history() {
        let tx = record(TransactionType::Transfer, Vertical::Fintech, 60_000.0);
        let c = ctx();
        assert!(NewDevice.check(&tx, &c).is_some());

        let small = record(TransactionType::Transfer, Vertical::Fintech, 50_000.0);
        assert!(NewDevice.check(&small, &c).is_none());

        let mut seen = ctx();
        seen.device_history = history(vec![entry(100.0, None)]);
        assert!(NewDevice.check(&tx, &seen).is_none());
    }

    #[test]
    fn loan_stacking_counts_24h_window() {
        let tx = record(TransactionType::LoanApplication, Vertical::Fintech, 200_000.0);
        let mut c = ctx();
        c.phone_velocity.count_24h = 2;
        assert!(LoanStacking.check(&tx, &c).is_none());
        c.phone_velocity.count_24h = 3;
        assert!(LoanStacking.check(&tx, &c).is_some());
    }

    #[test]
    fn velocity_spike_threshold() {
        let tx = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        let mut c = ctx();
        c.device_velocity.count_10m = 2;
        assert!(VelocitySpike.check(&tx, &c).is_none());
        c.device_velocity.count_10m = 3;
        assert!(VelocitySpike.check(&tx, &c).is_some());
    }

    #[test]
    fn round_amount_needs_both_conditions() {
        let c = ctx();
        let round = record(TransactionType::Transfer, Vertical::Fintech, 200_000.0);
        assert!(RoundAmount.check(&round, &c).is_some());

        let small_round = record(TransactionType::Transfer, Vertical::Fintech, 90_000.0);
        assert!(RoundAmount.check(&small_round, &c).is_none());

        let not_round = record(TransactionType::Transfer, Vertical::Fintech, 200_001.0);
        assert!(RoundAmount.check(&not_round, &c).is_none());
    }

    #[test]
    fn multiple_applications_needs_bvn() {
        let tx = record(TransactionType::LoanApplication, Vertical::Fintech, 200_000.0);
        let mut c = ctx();
        c.phone_velocity.count_1h = 2;
        assert!(MultipleApplications.check(&tx, &c).is_some());

        let mut without_bvn = tx.clone();
        without_bvn.bvn_hash = crate::hashing::HashedId::empty();
        assert!(MultipleApplications.check(&without_bvn, &c).is_none());

        c.phone_velocity.count_1h = 1;
        assert!(MultipleApplications.check(&tx, &c).is_none());
    }

    #[test]
    fn device_history_fraud_ratio() {
        let tx = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        let mut c = ctx();
        c.device_history = history(vec![
            entry(100.0, Some(true)),
            entry(100.0, Some(true)),
            entry(100.0, Some(false)),
        ]);
        assert!(DeviceHistoryFraud.check(&tx, &c).is_some());

        // Exactly half is not "more than half".
        c.device_history = history(vec![entry(100.0, Some(true)), entry(100.0, None)]);
        assert!(DeviceHistoryFraud.check(&tx, &c).is_none());

        c.device_history = history(vec![]);
        assert!(DeviceHistoryFraud.check(&tx, &c).is_none());
    }

    #[test]
    fn card_testing_pattern() {
        let tx = record(TransactionType::Purchase, Vertical::Ecommerce, 500.0);
        let mut c = ctx();
        c.device_velocity.count_10m = 5;
        assert!(CardTesting.check(&tx, &c).is_some());

        let expensive = record(TransactionType::Purchase, Vertical::Ecommerce, 5_000.0);
        assert!(CardTesting.check(&expensive, &c).is_none());

        c.device_velocity.count_10m = 4;
        assert!(CardTesting.check(&tx, &c).is_none());
    }

    #[test]
    fn impossible_travel_speed_gate() {
        // Lagos -> London is ~5000 km; in one hour that is far beyond 900 km/h.
        let mut tx = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        tx.location = Some(Location {
            lat: 51.5,
            lon: -0.12,
            city: None,
            state: None,
            country: None,
        });
        let mut c = ctx();
        c.device_history = history(vec![DeviceHistoryEntry {
            amount: 100.0,
            actual_fraud: None,
            created_at: c.now - Duration::hours(1),
            location: Some(Location {
                lat: 6.45,
                lon: 3.39,
                city: None,
                state: None,
                country: None,
            }),
        }]);
        assert!(ImpossibleTravel.check(&tx, &c).is_some());

        // Same geometry a week apart is fine.
        c.device_history.entries[0].created_at = c.now - Duration::days(7);
        assert!(ImpossibleTravel.check(&tx, &c).is_none());

        // No location on the incoming transaction: nothing to compare.
        let bare = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        assert!(ImpossibleTravel.check(&bare, &c).is_none());
    }

    #[test]
    fn bonus_abuse_first_bet() {
        let tx = record(TransactionType::BetPlacement, Vertical::Betting, 2_000.0);
        let c = ctx();
        assert!(BonusAbuse.check(&tx, &c).is_some());

        let mut seen = ctx();
        seen.device_history = history(vec![entry(100.0, None)]);
        assert!(BonusAbuse.check(&tx, &seen).is_none());
    }

    #[test]
    fn crypto_rapid_flow_threshold() {
        let tx = record(TransactionType::CryptoWithdrawal, Vertical::Crypto, 90_000.0);
        let mut c = ctx();
        c.device_velocity.count_1h = 4;
        assert!(CryptoRapidFlow.check(&tx, &c).is_none());
        c.device_velocity.count_1h = 5;
        assert!(CryptoRapidFlow.check(&tx, &c).is_some());
    }

    #[test]
    fn new_seller_high_value() {
        let tx = record(
            TransactionType::MarketplaceListing,
            Vertical::Marketplace,
            150_000.0,
        );
        let c = ctx();
        assert!(NewSellerHighValue.check(&tx, &c).is_some());

        let cheap = record(
            TransactionType::MarketplaceListing,
            Vertical::Marketplace,
            80_000.0,
        );
        assert!(NewSellerHighValue.check(&cheap, &c).is_none());
    }

    #[test]
    fn ip_device_spread_threshold() {
        let tx = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        let mut c = ctx();
        c.ip_device_count = 2;
        assert!(IpDeviceSpread.check(&tx, &c).is_none());
        c.ip_device_count = 3;
        assert!(IpDeviceSpread.check(&tx, &c).is_some());
    }

    #[test]
    fn haversine_sanity() {
        // Lagos to Abuja is roughly 520 km.
        let d = haversine_km(6.45, 3.39, 9.06, 7.49);
        assert!((450.0..600.0).contains(&d), "got {}", d);
        assert!(haversine_km(6.45, 3.39, 6.45, 3.39) < 1e-9);
    }

    #[test]
    fn catalogue_ids_are_unique_and_ordered() {
        let rules = default_rules();
        let ids: Vec<u32> = rules.iter().map(|r| r.id()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids.len(), sorted.len());
        assert_eq!(ids, sorted, "catalogue must stay ordered by id");
    }
}
