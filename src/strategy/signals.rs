use crate::config::StrategyConfig;
use crate::indicators::IndicatorSnapshot;
use crate::models::{PositionSide, Signal};

/// RSI distance past the entry thresholds that forces an exit
pub const EXIT_RSI_MARGIN: f64 = 5.0;

fn volume_confirmed(last: &IndicatorSnapshot, config: &StrategyConfig) -> bool {
    if !config.volume_filter {
        return true;
    }
    match last.rolling_volume_avg {
        Some(avg) => last.volume > avg,
        // Not enough bars for the average yet
        None => false,
    }
}

/// Crossover entry rule over the last two snapshots
///
/// Buy on an upward EMA cross with RSI below overbought, Sell on a downward
/// cross with RSI above oversold. Buy wins a tie. Invalid (warm-up)
/// snapshots never produce a signal.
pub fn detect_entry(
    prev: &IndicatorSnapshot,
    last: &IndicatorSnapshot,
    config: &StrategyConfig,
) -> Signal {
    if !prev.valid || !last.valid {
        return Signal::Hold;
    }

    // EMAs compare at the instrument's price precision
    let prev_rounded = prev.rounded(config.price_decimals);
    let last_rounded = last.rounded(config.price_decimals);
    let (prev_fast, prev_slow) = (prev_rounded.ema_fast, prev_rounded.ema_slow);
    let (fast, slow) = (last_rounded.ema_fast, last_rounded.ema_slow);
    let volume_ok = volume_confirmed(last, config);

    let crossed_up = fast > slow && prev_fast <= prev_slow;
    let crossed_down = fast < slow && prev_fast >= prev_slow;

    tracing::debug!(
        ema_fast = fast,
        ema_slow = slow,
        rsi = last.rsi,
        crossed_up,
        crossed_down,
        volume_ok,
        "Entry check"
    );

    if crossed_up && last.rsi < config.rsi_overbought && volume_ok {
        tracing::info!(
            "📈 BUY: EMA{} {:.prec$} crossed above EMA{} {:.prec$}, RSI={:.1}",
            config.ema_fast_period,
            fast,
            config.ema_slow_period,
            slow,
            last.rsi,
            prec = config.price_decimals as usize
        );
        Signal::Buy
    } else if crossed_down && last.rsi > config.rsi_oversold && volume_ok {
        tracing::info!(
            "📉 SELL: EMA{} {:.prec$} crossed below EMA{} {:.prec$}, RSI={:.1}",
            config.ema_fast_period,
            fast,
            config.ema_slow_period,
            slow,
            last.rsi,
            prec = config.price_decimals as usize
        );
        Signal::Sell
    } else {
        Signal::Hold
    }
}

/// Whether an open position should be closed on the latest snapshot
///
/// Long exits when the fast EMA drops under the slow one or RSI runs past
/// overbought by [`EXIT_RSI_MARGIN`]; Short mirrors it. Always false when flat.
pub fn detect_exit(side: PositionSide, last: &IndicatorSnapshot, config: &StrategyConfig) -> bool {
    if !last.valid {
        return false;
    }

    let rounded = last.rounded(config.price_decimals);
    let (fast, slow) = (rounded.ema_fast, rounded.ema_slow);
    match side {
        PositionSide::Long => fast < slow || last.rsi > config.rsi_overbought + EXIT_RSI_MARGIN,
        PositionSide::Short => fast > slow || last.rsi < config.rsi_oversold - EXIT_RSI_MARGIN,
        PositionSide::Flat => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::compute_series;
    use crate::models::PriceBar;
    use chrono::{Duration, Utc};

    const SCENARIO: [f64; 13] = [
        100.0, 101.0, 102.0, 103.0, 102.0, 101.0, 100.0, 99.0, 98.0, 99.0, 100.0, 102.0, 105.0,
    ];

    fn scenario_config() -> StrategyConfig {
        StrategyConfig {
            ema_fast_period: 3,
            ema_slow_period: 5,
            rsi_period: 3,
            rsi_overbought: 85.0,
            rsi_oversold: 15.0,
            price_decimals: 2,
            ..Default::default()
        }
    }

    fn bars_from_closes(closes: &[f64]) -> Vec<PriceBar> {
        let start = Utc::now() - Duration::minutes(5 * (closes.len() as i64 + 1));
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| PriceBar {
                timestamp: start + Duration::minutes(5 * i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    fn snapshot(ema_fast: f64, ema_slow: f64, rsi: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            timestamp: Utc::now(),
            close: 100.0,
            volume: 1000.0,
            ema_fast,
            ema_slow,
            rsi,
            rolling_volume_avg: Some(900.0),
            valid: true,
        }
    }

    fn exits(side: PositionSide, fast: f64, slow: f64, rsi: f64) -> bool {
        detect_exit(side, &snapshot(fast, slow, rsi), &scenario_config())
    }

    fn signals_for(closes: &[f64], config: &StrategyConfig) -> Vec<Signal> {
        let series = compute_series(&bars_from_closes(closes), config);
        let mut signals = vec![Signal::Hold];
        for pair in series.windows(2) {
            signals.push(detect_entry(&pair[0], &pair[1], config));
        }
        signals
    }

    #[test]
    fn test_scenario_fires_exactly_at_cross_bars() {
        let signals = signals_for(&SCENARIO, &scenario_config());

        let fired: Vec<(usize, Signal)> = signals
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != Signal::Hold)
            .map(|(i, s)| (i, *s))
            .collect();

        // fast crosses under slow at bar 6, back over at bar 11
        assert_eq!(fired, vec![(6, Signal::Sell), (11, Signal::Buy)]);
    }

    #[test]
    fn test_warm_up_cross_is_ignored() {
        // Bar 1 is an upward cross from the seeded equal EMAs but RSI is not warm
        let config = scenario_config();
        let series = compute_series(&bars_from_closes(&SCENARIO[..3]), &config);
        assert!(series[1].ema_fast > series[1].ema_slow);
        assert_eq!(detect_entry(&series[0], &series[1], &config), Signal::Hold);
    }

    #[test]
    fn test_rsi_threshold_blocks_buy() {
        let config = StrategyConfig {
            rsi_overbought: 80.0,
            ..scenario_config()
        };
        // RSI at bar 11 is ~80.5
        let signals = signals_for(&SCENARIO, &config);
        assert_eq!(signals[11], Signal::Hold);
    }

    #[test]
    fn test_prev_equal_counts_as_cross() {
        let config = scenario_config();
        let prev = snapshot(100.0, 100.0, 50.0);
        assert_eq!(
            detect_entry(&prev, &snapshot(100.5, 100.0, 50.0), &config),
            Signal::Buy
        );
        assert_eq!(
            detect_entry(&prev, &snapshot(99.5, 100.0, 50.0), &config),
            Signal::Sell
        );
    }

    #[test]
    fn test_difference_below_precision_is_not_a_cross() {
        let config = scenario_config();
        let prev = snapshot(100.0, 100.001, 50.0);
        let last = snapshot(100.002, 100.001, 50.0);
        assert_eq!(detect_entry(&prev, &last, &config), Signal::Hold);
    }

    #[test]
    fn test_entry_signals_mutually_exclusive() {
        let config = scenario_config();
        let values = [99.0, 99.995, 100.0, 100.004, 101.0];
        for &pf in &values {
            for &ps in &values {
                for &lf in &values {
                    for &ls in &values {
                        for rsi in [0.0, 10.0, 50.0, 90.0, 100.0] {
                            let prev = snapshot(pf, ps, rsi);
                            let last = snapshot(lf, ls, rsi);
                            let signal = detect_entry(&prev, &last, &config);
                            let rounded = last.rounded(2);
                            match signal {
                                Signal::Buy => assert!(rounded.ema_fast > rounded.ema_slow),
                                Signal::Sell => assert!(rounded.ema_fast < rounded.ema_slow),
                                Signal::Hold => {}
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_volume_filter() {
        let config = StrategyConfig {
            volume_filter: true,
            ..scenario_config()
        };
        let prev = snapshot(100.0, 100.0, 50.0);

        let mut last = snapshot(101.0, 100.0, 50.0);
        last.volume = 1000.0;
        last.rolling_volume_avg = Some(900.0);
        assert_eq!(detect_entry(&prev, &last, &config), Signal::Buy);

        last.volume = 800.0;
        assert_eq!(detect_entry(&prev, &last, &config), Signal::Hold);

        last.rolling_volume_avg = None;
        last.volume = 5000.0;
        assert_eq!(detect_entry(&prev, &last, &config), Signal::Hold);
    }

    #[test]
    fn test_exit_false_when_flat() {
        let config = scenario_config();
        for (fast, slow, rsi) in [(1.0, 2.0, 0.0), (2.0, 1.0, 100.0), (1.0, 1.0, 50.0)] {
            let last = snapshot(fast, slow, rsi);
            assert!(!detect_exit(PositionSide::Flat, &last, &config));
        }
    }

    #[test]
    fn test_long_exit_rules() {
        // Trend intact, RSI fine
        assert!(!exits(PositionSide::Long, 101.0, 100.0, 60.0));
        // Fast under slow
        assert!(exits(PositionSide::Long, 99.0, 100.0, 60.0));
        // RSI beyond overbought + margin
        assert!(exits(PositionSide::Long, 101.0, 100.0, 90.5));
        assert!(!exits(PositionSide::Long, 101.0, 100.0, 89.0));
    }

    #[test]
    fn test_short_exit_rules() {
        assert!(!exits(PositionSide::Short, 99.0, 100.0, 40.0));
        assert!(exits(PositionSide::Short, 101.0, 100.0, 40.0));
        assert!(exits(PositionSide::Short, 99.0, 100.0, 9.0));
        assert!(!exits(PositionSide::Short, 99.0, 100.0, 11.0));
    }

    #[test]
    fn test_invalid_snapshot_never_signals() {
        let config = scenario_config();
        let prev = snapshot(100.0, 100.0, 50.0);
        let mut last = snapshot(101.0, 100.0, 50.0);
        last.valid = false;
        assert_eq!(detect_entry(&prev, &last, &config), Signal::Hold);

        let mut crossed_under = snapshot(99.0, 100.0, 50.0);
        crossed_under.valid = false;
        assert!(!detect_exit(PositionSide::Long, &crossed_under, &config));
    }
}
