//! ELO rating arithmetic.

/// Rating volatility factor.
pub const K_FACTOR: f64 = 32.0;

/// Expected score of a player rated `own` against a player rated `opponent`.
pub fn expected_score(own: i32, opponent: i32) -> f64 {
    1.0 / (1.0 + 10f64.powf(f64::from(opponent - own) / 400.0))
}

/// Rating change for the player rated `own`, given the achieved `score`
/// (1.0 win, 0.5 draw, 0.0 loss). Applied as `+delta` to this player and
/// `-delta` to the opponent, which keeps the rating sum constant.
pub fn delta(own: i32, opponent: i32, score: f64) -> i32 {
    (K_FACTOR * (score - expected_score(own, opponent))).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_ratings_win_is_sixteen() {
        assert_eq!(delta(500, 500, 1.0), 16);
    }

    #[test]
    fn equal_ratings_draw_is_zero() {
        assert_eq!(delta(500, 500, 0.5), 0);
    }

    #[test]
    fn underdog_draw_gains() {
        // 200 points down, E ~ 0.24, delta = round(32 * 0.26) = 8.
        assert_eq!(delta(500, 700, 0.5), 8);
    }

    #[test]
    fn favorite_win_gains_little() {
        let d = delta(900, 500, 1.0);
        assert!(d < 16, "favorite should gain less than an even win: {d}");
        assert!(d >= 0);
    }

    #[test]
    fn symmetric_application_preserves_rating_sum() {
        for (a, b, score) in [(500, 500, 1.0), (500, 700, 0.5), (650, 480, 1.0), (1200, 300, 0.5)]
        {
            let d = delta(a, b, score);
            assert_eq!((a + d) + (b - d), a + b);
        }
    }

    #[test]
    fn expected_scores_of_both_sides_sum_to_one() {
        for (a, b) in [(500, 500), (500, 700), (1200, 300)] {
            let total = expected_score(a, b) + expected_score(b, a);
            assert!((total - 1.0).abs() < 1e-9);
        }
    }
}
