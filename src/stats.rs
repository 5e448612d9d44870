//! The fixed set of hypothesis tests used for cohort comparison: Welch's
//! t-test and one-way ANOVA for continuous series, chi-square for 2xk
//! contingency counts.
//!
//! Every function returns `None` instead of a value when the inputs can't
//! support the test (too few observations, empty margins, zero variance);
//! the report layer renders that as an undefined cell rather than aborting
//! the run.

use noisy_float::prelude::*;
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor, StudentsT};

/// A computed test statistic and its two-sided p-value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestOutcome {
    pub statistic: f64,
    pub p: f64,
}

pub fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().sum::<f64>() / xs.len() as f64)
}

/// Unbiased sample variance; needs at least two observations.
pub fn sample_variance(xs: &[f64]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    let m = mean(xs)?;
    Some(xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64)
}

pub fn sd(xs: &[f64]) -> Option<f64> {
    sample_variance(xs).map(f64::sqrt)
}

pub fn median(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let mut sorted: Vec<N64> = xs.iter().map(|x| n64(*x)).collect();
    sorted.sort();
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 1 {
        sorted[mid].raw()
    } else {
        (sorted[mid - 1].raw() + sorted[mid].raw()) / 2.0
    })
}

pub fn days_to_f64(days: &[i64]) -> Vec<f64> {
    days.iter().map(|d| *d as f64).collect()
}

/// Proportion with an explicit undefined state: a zero denominator reports
/// `None` rather than dividing.
pub fn rate(count: usize, denom: usize) -> Option<f64> {
    if denom == 0 {
        None
    } else {
        Some(count as f64 / denom as f64)
    }
}

/// Welch's unequal-variance t-test between two series.
pub fn welch_t_test(a: &[f64], b: &[f64]) -> Option<TestOutcome> {
    if a.len() < 2 || b.len() < 2 {
        return None;
    }
    let (na, nb) = (a.len() as f64, b.len() as f64);
    let (ma, mb) = (mean(a)?, mean(b)?);
    let (va, vb) = (sample_variance(a)?, sample_variance(b)?);
    let (sea, seb) = (va / na, vb / nb);
    let se2 = sea + seb;
    if se2 == 0.0 {
        // both series constant; equal means carry no evidence either way
        return if ma == mb {
            Some(TestOutcome { statistic: 0.0, p: 1.0 })
        } else {
            None
        };
    }
    let t = (ma - mb) / se2.sqrt();
    // Welch-Satterthwaite degrees of freedom
    let df = se2 * se2 / (sea * sea / (na - 1.0) + seb * seb / (nb - 1.0));
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p = 2.0 * (1.0 - dist.cdf(t.abs()));
    Some(TestOutcome { statistic: t, p })
}

/// Pearson chi-square over a 2xk contingency table given as its two rows.
///
/// Columns empty in both rows are dropped before computing expecteds; the
/// test is undefined if fewer than two informative columns remain or either
/// row margin is zero.
pub fn chi_square_2xk(row_a: &[u64], row_b: &[u64]) -> Option<TestOutcome> {
    debug_assert_eq!(row_a.len(), row_b.len());
    let cols: Vec<(f64, f64)> = row_a
        .iter()
        .zip(row_b.iter())
        .map(|(a, b)| (*a as f64, *b as f64))
        .filter(|(a, b)| a + b > 0.0)
        .collect();
    if cols.len() < 2 {
        return None;
    }
    let margin_a: f64 = cols.iter().map(|c| c.0).sum();
    let margin_b: f64 = cols.iter().map(|c| c.1).sum();
    if margin_a == 0.0 || margin_b == 0.0 {
        return None;
    }
    let total = margin_a + margin_b;
    let mut statistic = 0.0;
    for (a, b) in &cols {
        let col_total = a + b;
        let expected_a = margin_a * col_total / total;
        let expected_b = margin_b * col_total / total;
        statistic += (a - expected_a).powi(2) / expected_a;
        statistic += (b - expected_b).powi(2) / expected_b;
    }
    let df = (cols.len() - 1) as f64;
    let dist = ChiSquared::new(df).ok()?;
    let p = 1.0 - dist.cdf(statistic);
    Some(TestOutcome { statistic, p })
}

/// One-way ANOVA across two or more series.
pub fn one_way_anova(groups: &[&[f64]]) -> Option<TestOutcome> {
    let groups: Vec<&[f64]> = groups.iter().copied().filter(|g| !g.is_empty()).collect();
    let k = groups.len();
    if k < 2 {
        return None;
    }
    let n: usize = groups.iter().map(|g| g.len()).sum();
    if n <= k {
        return None;
    }
    let grand_mean = groups.iter().flat_map(|g| g.iter()).sum::<f64>() / n as f64;
    let mut ss_between = 0.0;
    let mut ss_within = 0.0;
    for g in &groups {
        let m = g.iter().sum::<f64>() / g.len() as f64;
        ss_between += g.len() as f64 * (m - grand_mean).powi(2);
        ss_within += g.iter().map(|x| (x - m).powi(2)).sum::<f64>();
    }
    let df_between = (k - 1) as f64;
    let df_within = (n - k) as f64;
    let ms_within = ss_within / df_within;
    if ms_within == 0.0 {
        return None;
    }
    let statistic = (ss_between / df_between) / ms_within;
    let dist = FisherSnedecor::new(df_between, df_within).ok()?;
    let p = 1.0 - dist.cdf(statistic);
    Some(TestOutcome { statistic, p })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chi_square_matches_reference() {
        // virtual procedures [12 completed, 3 canceled] vs office
        // [20 completed, 10 canceled]; reference values from
        // scipy.stats.chi2_contingency without continuity correction
        let outcome = chi_square_2xk(&[12, 3], &[20, 10]).unwrap();
        assert!((outcome.statistic - 0.8654).abs() < 1e-4, "{}", outcome.statistic);
        assert!((outcome.p - 0.3522).abs() < 5e-4, "{}", outcome.p);
    }

    #[test]
    fn chi_square_undefined_cases() {
        // one informative column
        assert!(chi_square_2xk(&[5, 0], &[9, 0]).is_none());
        // an empty row margin
        assert!(chi_square_2xk(&[0, 0], &[9, 4]).is_none());
    }

    #[test]
    fn welch_identical_samples() {
        let xs = [4.0, 8.0, 15.0, 16.0, 23.0, 42.0];
        let outcome = welch_t_test(&xs, &xs).unwrap();
        assert!(outcome.statistic.abs() < 1e-12);
        assert!((outcome.p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn welch_known_difference() {
        let a = [10.0, 12.0, 9.0, 11.0, 13.0];
        let b = [20.0, 22.0, 19.0, 21.0, 23.0];
        let outcome = welch_t_test(&a, &b).unwrap();
        assert!(outcome.statistic < 0.0);
        assert!(outcome.p < 0.001);
    }

    #[test]
    fn welch_needs_two_observations() {
        assert!(welch_t_test(&[1.0], &[2.0, 3.0]).is_none());
    }

    #[test]
    fn anova_equal_means() {
        let a = [1.0, 2.0, 3.0];
        let b = [2.0, 2.0, 2.0];
        let outcome = one_way_anova(&[&a, &b]).unwrap();
        assert!(outcome.statistic.abs() < 1e-12);
        assert!((outcome.p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn anova_detects_separation() {
        let a = [1.0, 2.0, 1.5];
        let b = [10.0, 11.0, 10.5];
        let c = [20.0, 21.0, 20.5];
        let outcome = one_way_anova(&[&a, &b, &c]).unwrap();
        assert!(outcome.p < 1e-6);
    }

    #[test]
    fn rate_guards_zero_denominator() {
        assert_eq!(rate(3, 12), Some(0.25));
        assert_eq!(rate(3, 0), None);
    }

    #[test]
    fn median_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }
}
