//! Derived market-intelligence aggregates.
//!
//! Read-side views computed over the bus histories in O(k) of the last k
//! entries. All outputs are advisory scores; strategies decide whether to
//! act on them.
//!
//! `signal_strength` blends four components: recent news sentiment (weight
//! 0.40, 60-minute window), whale buy/sell imbalance (0.30, 30-minute
//! window), global sentiment (0.20), and hot-token presence (0.10).
//! Components with no observable data are excluded and the remaining
//! weights renormalized, so one strong component is not diluted by silence
//! in the others. The result is clamped to [-1, 1].

use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use swarm_common::Side;

use super::bus::SignalBus;
use super::types::NewsImpact;

/// News window feeding `signal_strength`.
const NEWS_WINDOW: Duration = Duration::from_secs(60 * 60);
/// Whale window feeding `signal_strength`.
const WHALE_WINDOW: Duration = Duration::from_secs(30 * 60);
/// High-impact news window for the scan-frequency gate.
const SCAN_NEWS_WINDOW: Duration = Duration::from_secs(15 * 60);

const NEWS_WEIGHT: f64 = 0.40;
const WHALE_WEIGHT: f64 = 0.30;
const GLOBAL_WEIGHT: f64 = 0.20;
const HOT_WEIGHT: f64 = 0.10;

fn mentions(haystack: &str, entity: &str) -> bool {
    haystack.to_lowercase().contains(&entity.to_lowercase())
}

impl SignalBus {
    /// Blended signal strength for an entity, in [-1, 1].
    pub fn signal_strength(&self, entity: &str) -> f64 {
        let mut acc = 0.0;
        let mut weight = 0.0;

        let news: Vec<f64> = self
            .news_events(NEWS_WINDOW)
            .iter()
            .filter(|n| n.entities.iter().any(|e| mentions(e, entity) || mentions(entity, e)))
            .map(|n| n.sentiment * n.confidence)
            .collect();
        if !news.is_empty() {
            acc += NEWS_WEIGHT * (news.iter().sum::<f64>() / news.len() as f64);
            weight += NEWS_WEIGHT;
        }

        let moves = self.whale_moves(WHALE_WINDOW);
        let mut buy = Decimal::ZERO;
        let mut sell = Decimal::ZERO;
        for mv in moves.iter().filter(|m| mentions(&m.entity, entity)) {
            match mv.side {
                Side::Buy => buy += mv.usd_amount,
                Side::Sell => sell += mv.usd_amount,
            }
        }
        let total = buy + sell;
        if total > Decimal::ZERO {
            let imbalance = ((buy - sell) / total).to_f64().unwrap_or(0.0);
            acc += WHALE_WEIGHT * imbalance;
            weight += WHALE_WEIGHT;
        }

        if let Some(global) = self.global_sentiment() {
            acc += GLOBAL_WEIGHT * global.score;
            weight += GLOBAL_WEIGHT;
        }

        let hot = self.hot_tokens(self.history_capacity());
        if !hot.is_empty() {
            let present = hot
                .iter()
                .any(|h| mentions(&h.market_name, entity) || mentions(&h.token_id, entity));
            acc += HOT_WEIGHT * if present { 1.0 } else { 0.0 };
            weight += HOT_WEIGHT;
        }

        if weight == 0.0 {
            return 0.0;
        }
        (acc / weight).clamp(-1.0, 1.0)
    }

    /// Advisory position-size multiplier derived from `signal_strength`,
    /// in [0.5, 2.0].
    pub fn position_multiplier(&self, entity: &str) -> f64 {
        let strength = self.signal_strength(entity).abs();
        let multiplier = if strength > 0.7 {
            1.5 + (strength - 0.7) * 1.667
        } else if strength < 0.3 {
            0.5 + (strength / 0.3) * 0.5
        } else {
            1.0
        };
        multiplier.clamp(0.5, 2.0)
    }

    /// Whether strategies watching this entity should scan more often:
    /// high-impact news in the last 15 minutes, a whale move in the last 30
    /// minutes, or presence in the current hot-token set.
    pub fn should_increase_scan_frequency(&self, entity: &str) -> bool {
        let hot_news = self.news_events(SCAN_NEWS_WINDOW).iter().any(|n| {
            n.impact == NewsImpact::High
                && n.entities.iter().any(|e| mentions(e, entity) || mentions(entity, e))
        });
        if hot_news {
            return true;
        }
        if self
            .whale_moves(WHALE_WINDOW)
            .iter()
            .any(|m| mentions(&m.entity, entity))
        {
            return true;
        }
        self.hot_tokens(self.history_capacity())
            .iter()
            .any(|h| mentions(&h.market_name, entity) || mentions(&h.token_id, entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::bus::BusConfig;
    use crate::signal::types::{
        GlobalSentiment, HotReason, HotToken, NewsEvent, Signal, SignalPayload, SignalPriority,
        WhaleMove,
    };
    use rust_decimal_macros::dec;

    fn news_signal(entity: &str, sentiment: f64, confidence: f64, impact: NewsImpact) -> Signal {
        Signal::new(
            "news",
            SignalPriority::Medium,
            Some(3600),
            SignalPayload::NewsEvent(NewsEvent {
                headline: format!("{entity} moves"),
                entities: vec![entity.to_string()],
                sentiment,
                confidence,
                impact,
                source: "wire".into(),
                related_markets: vec![],
            }),
        )
    }

    fn whale_signal(entity: &str, side: Side, usd: Decimal) -> Signal {
        Signal::new(
            "whale-watch",
            SignalPriority::High,
            Some(3600),
            SignalPayload::WhaleMove(WhaleMove {
                wallet_id: "0xabc".into(),
                wallet_label: "smart-money".into(),
                market_id: "m1".into(),
                token_id: "t1".into(),
                side,
                usd_amount: usd,
                price: dec!(0.55),
                entity: entity.to_string(),
            }),
        )
    }

    // News + whale convergence pushes strength over the boost threshold.
    #[tokio::test]
    async fn convergence_boosts_strength_and_multiplier() {
        let bus = SignalBus::new(BusConfig::default());
        bus.publish(news_signal("BTC", 0.8, 0.9, NewsImpact::High)).unwrap();
        bus.publish(whale_signal("BTC", Side::Buy, dec!(50000))).unwrap();

        let strength = bus.signal_strength("BTC");
        assert!(strength >= 0.7, "strength {strength} should be >= 0.7");
        assert!(bus.position_multiplier("BTC") >= 1.5);
    }

    #[tokio::test]
    async fn strength_bounded() {
        let bus = SignalBus::new(BusConfig::default());
        for _ in 0..10 {
            bus.publish(news_signal("DOGE", -1.0, 1.0, NewsImpact::High)).unwrap();
            bus.publish(whale_signal("DOGE", Side::Sell, dec!(90000))).unwrap();
        }
        let strength = bus.signal_strength("DOGE");
        assert!((-1.0..=1.0).contains(&strength));
        let multiplier = bus.position_multiplier("DOGE");
        assert!((0.5..=2.0).contains(&multiplier));
    }

    #[tokio::test]
    async fn no_data_means_zero_strength() {
        let bus = SignalBus::new(BusConfig::default());
        assert_eq!(bus.signal_strength("BTC"), 0.0);
        // |0.0| < 0.3 lands on the reduction branch floor.
        assert_eq!(bus.position_multiplier("BTC"), 0.5);
    }

    #[tokio::test]
    async fn weak_signal_reduces_multiplier() {
        let bus = SignalBus::new(BusConfig::default());
        bus.publish(news_signal("ETH", 0.1, 0.5, NewsImpact::Low)).unwrap();
        let strength = bus.signal_strength("ETH").abs();
        assert!(strength < 0.3);
        let multiplier = bus.position_multiplier("ETH");
        assert!(multiplier < 1.0);
    }

    #[tokio::test]
    async fn mid_band_multiplier_is_neutral() {
        let bus = SignalBus::new(BusConfig::default());
        // One news item at 0.5 * 1.0 = 0.5 renormalizes to exactly 0.5.
        bus.publish(news_signal("SOL", 0.5, 1.0, NewsImpact::Medium)).unwrap();
        let strength = bus.signal_strength("SOL").abs();
        assert!((0.3..=0.7).contains(&strength));
        assert_eq!(bus.position_multiplier("SOL"), 1.0);
    }

    #[tokio::test]
    async fn opposing_whale_flow_cancels() {
        let bus = SignalBus::new(BusConfig::default());
        bus.publish(whale_signal("BTC", Side::Buy, dec!(10000))).unwrap();
        bus.publish(whale_signal("BTC", Side::Sell, dec!(10000))).unwrap();
        assert_eq!(bus.signal_strength("BTC"), 0.0);
    }

    #[tokio::test]
    async fn global_sentiment_contributes() {
        let bus = SignalBus::new(BusConfig::default());
        bus.publish(Signal::new(
            "news",
            SignalPriority::Medium,
            Some(3600),
            SignalPayload::GlobalSentiment(GlobalSentiment {
                score: -0.8,
                confidence: 0.9,
                dominant_topic: "regulation".into(),
                top_entities: vec!["BTC".into()],
                news_count_last_hour: 12,
            }),
        ))
        .unwrap();
        // Only the global component has data; renormalized to the score.
        let strength = bus.signal_strength("BTC");
        assert!((strength - (-0.8)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn scan_frequency_gates() {
        let bus = SignalBus::new(BusConfig::default());
        assert!(!bus.should_increase_scan_frequency("BTC"));

        bus.publish(news_signal("BTC", 0.2, 0.5, NewsImpact::Low)).unwrap();
        assert!(!bus.should_increase_scan_frequency("BTC"));

        bus.publish(news_signal("BTC", 0.2, 0.5, NewsImpact::High)).unwrap();
        assert!(bus.should_increase_scan_frequency("BTC"));

        assert!(!bus.should_increase_scan_frequency("ETH"));
        bus.publish(whale_signal("ETH", Side::Buy, dec!(25000))).unwrap();
        assert!(bus.should_increase_scan_frequency("ETH"));

        bus.publish(Signal::new(
            "scanner",
            SignalPriority::Medium,
            Some(600),
            SignalPayload::HotToken(HotToken {
                token_id: "tok-sol".into(),
                market_id: "m-sol".into(),
                market_name: "Solana above $200".into(),
                volume_1h: dec!(125000),
                velocity_per_min: 42.0,
                volatility: 0.12,
                reason: HotReason::NewsSpike,
            }),
        ))
        .unwrap();
        assert!(bus.should_increase_scan_frequency("Solana"));
    }
}
