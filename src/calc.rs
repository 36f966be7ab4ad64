//! Business arithmetic shared by the handlers: grade averages, payroll,
//! straight-line depreciation, document numbering and running balances.
//!
//! Everything here is pure (no database, no clock) so integration tests can
//! pull the module in directly with `#[path]`.

use chrono::{Datelike, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Monetary and grade values are kept at two decimal places, rounding ties
/// away from zero (commercial "half up").
pub fn round2(x: Decimal) -> Decimal {
    x.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("empty decimal".to_string());
    }
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|e| format!("invalid decimal `{}`: {}", s, e))
}

// ---------------------------------------------------------------------------
// Grades
// ---------------------------------------------------------------------------

pub const GRADE_MIN: Decimal = Decimal::ZERO;

pub fn grade_max() -> Decimal {
    Decimal::from(20)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Approved,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Approved => "APROVADO",
            Outcome::Failed => "REPROVADO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeSummary {
    pub partial_avg: Decimal,
    pub final_avg: Decimal,
    pub outcome: Outcome,
}

/// Partial average is the plain mean of the three marks; the final average
/// uses `weights`. Both are rounded only after division.
pub fn grade_summary(
    marks: [Decimal; 3],
    weights: [Decimal; 3],
    pass_mark: Decimal,
) -> Result<GradeSummary, String> {
    for (i, m) in marks.iter().enumerate() {
        if *m < GRADE_MIN || *m > grade_max() {
            return Err(format!("n{} must be between 0 and 20", i + 1));
        }
    }
    if weights.iter().any(|w| w.is_sign_negative()) {
        return Err("grade weights must not be negative".to_string());
    }
    let weight_sum: Decimal = weights.iter().copied().sum();
    if weight_sum.is_zero() {
        return Err("grade weights must not all be zero".to_string());
    }

    let sum: Decimal = marks.iter().copied().sum();
    let partial_avg = round2(sum / Decimal::from(3));
    let weighted: Decimal = marks
        .iter()
        .zip(weights.iter())
        .map(|(m, w)| *m * *w)
        .sum();
    let final_avg = round2(weighted / weight_sum);
    let outcome = if final_avg >= pass_mark {
        Outcome::Approved
    } else {
        Outcome::Failed
    };

    Ok(GradeSummary {
        partial_avg,
        final_avg,
        outcome,
    })
}

// ---------------------------------------------------------------------------
// Payroll
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayrollRates {
    pub hours_per_day: Decimal,
    pub working_days: Decimal,
    pub overtime_factor: Decimal,
    pub inss_rate: Decimal,
    pub irt_rate: Decimal,
}

impl Default for PayrollRates {
    fn default() -> Self {
        Self {
            hours_per_day: Decimal::from(8),
            working_days: Decimal::from(22),
            overtime_factor: Decimal::new(15, 1),
            inss_rate: Decimal::new(8, 2),
            irt_rate: Decimal::new(15, 2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayrollInput {
    pub base_salary: Decimal,
    pub overtime_hours: Decimal,
    pub deductions: Decimal,
    pub bonuses: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayslipAmounts {
    pub hourly_rate: Decimal,
    pub overtime_pay: Decimal,
    pub gross: Decimal,
    pub inss: Decimal,
    pub irt: Decimal,
    pub net: Decimal,
}

pub fn compute_payslip(input: PayrollInput, rates: PayrollRates) -> Result<PayslipAmounts, String> {
    let monthly_hours = rates.hours_per_day * rates.working_days;
    if monthly_hours <= Decimal::ZERO {
        return Err("payroll hoursPerDay × workingDays must be positive".to_string());
    }
    if input.overtime_hours.is_sign_negative()
        || input.deductions.is_sign_negative()
        || input.bonuses.is_sign_negative()
    {
        return Err("overtime, deductions and bonuses must not be negative".to_string());
    }

    let hourly = input.base_salary / monthly_hours;
    let overtime_pay = input.overtime_hours * hourly * rates.overtime_factor;
    let gross = input.base_salary + overtime_pay + input.bonuses - input.deductions;
    if gross.is_sign_negative() && !gross.is_zero() {
        return Err("deductions exceed base salary plus overtime and bonuses".to_string());
    }
    let inss = gross * rates.inss_rate;
    let irt = gross * rates.irt_rate;
    let net = gross - inss - irt;

    Ok(PayslipAmounts {
        hourly_rate: round2(hourly),
        overtime_pay: round2(overtime_pay),
        gross: round2(gross),
        inss: round2(inss),
        irt: round2(irt),
        net: round2(net),
    })
}

/// `YYYY-MM` → first day of that month.
pub fn parse_reference_month(raw: &str) -> Result<NaiveDate, String> {
    let s = raw.trim();
    let bytes = s.as_bytes();
    let shape_ok = bytes.len() == 7
        && bytes[4] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || b.is_ascii_digit());
    if !shape_ok {
        return Err("referenceMonth must look like YYYY-MM (e.g. 2025-04)".to_string());
    }
    let year: i32 = s[0..4].parse().map_err(|_| "bad year".to_string())?;
    let month: u32 = s[5..7].parse().map_err(|_| "bad month".to_string())?;
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| "referenceMonth month must be 01..12".to_string())
}

const MONTH_NAMES_PT: [&str; 12] = [
    "Janeiro",
    "Fevereiro",
    "Março",
    "Abril",
    "Maio",
    "Junho",
    "Julho",
    "Agosto",
    "Setembro",
    "Outubro",
    "Novembro",
    "Dezembro",
];

/// "2025-04" → "Abril de 2025". Falls back to the raw value.
pub fn month_label(reference_month: &str) -> String {
    match parse_reference_month(reference_month) {
        Ok(d) => format!("{} de {}", MONTH_NAMES_PT[d.month0() as usize], d.year()),
        Err(_) => reference_month.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Depreciation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Depreciation {
    pub months_elapsed: u32,
    pub accumulated: Decimal,
    pub net_book_value: Decimal,
}

pub fn months_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to.year() as i64 - from.year() as i64) * 12 + (to.month() as i64 - from.month() as i64)
}

/// Straight-line depreciation in whole months, clamped to the useful life.
pub fn straight_line(
    acquisition_value: Decimal,
    acquired_on: NaiveDate,
    useful_life_years: u32,
    as_of: NaiveDate,
) -> Depreciation {
    let total_months = useful_life_years as i64 * 12;
    if total_months == 0 {
        return Depreciation {
            months_elapsed: 0,
            accumulated: Decimal::ZERO,
            net_book_value: acquisition_value,
        };
    }

    let elapsed = months_between(acquired_on, as_of).clamp(0, total_months);
    let monthly = acquisition_value / Decimal::from(total_months);
    let accumulated = if elapsed == total_months {
        acquisition_value
    } else {
        round2(monthly * Decimal::from(elapsed))
    };
    let mut net = acquisition_value - accumulated;
    if net.is_sign_negative() {
        net = Decimal::ZERO;
    }

    Depreciation {
        months_elapsed: elapsed as u32,
        accumulated,
        net_book_value: net,
    }
}

// ---------------------------------------------------------------------------
// Document numbers
// ---------------------------------------------------------------------------

/// Highest numeric suffix among `issued` values that start with `prefix`.
/// Values whose remainder is not all digits are ignored.
pub fn last_sequence<'a, I>(prefix: &str, issued: I) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    issued
        .into_iter()
        .filter_map(|n| n.strip_prefix(prefix))
        .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|rest| rest.parse::<u32>().ok())
        .max()
        .unwrap_or(0)
}

/// Student enrollment number: `{year}{seq:04}`, e.g. `20250001`.
pub fn next_enrollment_no<'a, I>(year: i32, issued: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = year.to_string();
    format!("{}{:04}", prefix, last_sequence(&prefix, issued) + 1)
}

/// Invoice number: `{year}/{seq:04}`, e.g. `2025/0001`.
pub fn next_invoice_no<'a, I>(year: i32, issued: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = format!("{}/", year);
    format!("{}{:04}", prefix, last_sequence(&prefix, issued) + 1)
}

/// Receipt number: `REC/{year}/{seq:04}`.
pub fn next_receipt_no<'a, I>(year: i32, issued: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = format!("REC/{}/", year);
    format!("{}{:04}", prefix, last_sequence(&prefix, issued) + 1)
}

// ---------------------------------------------------------------------------
// Running balance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceTotals {
    pub total_debit: Decimal,
    pub total_credit: Decimal,
    pub balance: Decimal,
}

pub fn running_balance<D, C>(invoice_amounts: D, receipt_amounts: C) -> BalanceTotals
where
    D: IntoIterator<Item = Decimal>,
    C: IntoIterator<Item = Decimal>,
{
    let total_debit: Decimal = invoice_amounts.into_iter().sum();
    let total_credit: Decimal = receipt_amounts.into_iter().sum();
    BalanceTotals {
        total_debit: round2(total_debit),
        total_credit: round2(total_credit),
        balance: round2(total_debit - total_credit),
    }
}

/// Status an unpaid invoice should carry on `today`.
pub fn unpaid_status(due: NaiveDate, today: NaiveDate) -> &'static str {
    if due < today {
        "VENCIDO"
    } else {
        "PENDENTE"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        parse_decimal(s).expect("decimal")
    }

    fn date(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("date")
    }

    #[test]
    fn round2_is_half_up() {
        assert_eq!(round2(d("2.345")), d("2.35"));
        assert_eq!(round2(d("2.344")), d("2.34"));
        assert_eq!(round2(d("-2.345")), d("-2.35"));
    }

    #[test]
    fn grade_summary_uses_weights_for_final_only() {
        let s = grade_summary(
            [d("10"), d("12"), d("14")],
            [d("1"), d("1"), d("2")],
            d("10"),
        )
        .expect("summary");
        assert_eq!(s.partial_avg, d("12.00"));
        assert_eq!(s.final_avg, d("12.50"));
        assert_eq!(s.outcome, Outcome::Approved);
    }

    #[test]
    fn grade_summary_fails_below_pass_mark() {
        let one = Decimal::ONE;
        let s = grade_summary([d("9"), d("9"), d("10")], [one, one, one], d("10")).expect("summary");
        assert_eq!(s.final_avg, d("9.33"));
        assert_eq!(s.outcome, Outcome::Failed);
    }

    #[test]
    fn grade_summary_rejects_out_of_range_marks() {
        let one = Decimal::ONE;
        let e = grade_summary([d("21"), d("0"), d("0")], [one, one, one], d("10")).unwrap_err();
        assert!(e.contains("n1"));
    }

    #[test]
    fn payslip_rejects_negative_gross() {
        let input = |deductions: &str| PayrollInput {
            base_salary: d("1000"),
            overtime_hours: d("0"),
            deductions: d(deductions),
            bonuses: d("200"),
        };
        let e = compute_payslip(input("1200.01"), PayrollRates::default()).unwrap_err();
        assert!(e.starts_with("deductions"));
        let zero = compute_payslip(input("1200"), PayrollRates::default()).expect("payslip");
        assert_eq!(zero.net, d("0.00"));
    }

    #[test]
    fn payslip_applies_overtime_and_taxes() {
        let p = compute_payslip(
            PayrollInput {
                base_salary: d("176000"),
                overtime_hours: d("10"),
                deductions: d("500"),
                bonuses: d("2000"),
            },
            PayrollRates::default(),
        )
        .expect("payslip");
        // hourly = 176000 / 176 = 1000, overtime = 10 * 1000 * 1.5
        assert_eq!(p.hourly_rate, d("1000.00"));
        assert_eq!(p.overtime_pay, d("15000.00"));
        assert_eq!(p.gross, d("192500.00"));
        assert_eq!(p.inss, d("15400.00"));
        assert_eq!(p.irt, d("28875.00"));
        assert_eq!(p.net, d("148225.00"));
    }

    #[test]
    fn reference_month_shape_is_enforced() {
        assert_eq!(parse_reference_month("2025-04").unwrap(), date(2025, 4, 1));
        assert!(parse_reference_month("2025-13").is_err());
        assert!(parse_reference_month("2025/04").is_err());
        assert!(parse_reference_month("25-04").is_err());
        assert_eq!(month_label("2025-04"), "Abril de 2025");
    }

    #[test]
    fn depreciation_decreases_monotonically_to_zero() {
        let value = d("12000");
        let acquired = date(2020, 1, 15);
        let mut previous = value;
        for months in 0..=40 {
            let as_of = acquired
                .checked_add_months(chrono::Months::new(months))
                .expect("date");
            let dep = straight_line(value, acquired, 3, as_of);
            assert!(dep.net_book_value <= previous);
            assert!(!dep.net_book_value.is_sign_negative());
            previous = dep.net_book_value;
        }
        let end = straight_line(value, acquired, 3, date(2030, 1, 1));
        assert_eq!(end.months_elapsed, 36);
        assert_eq!(end.net_book_value, Decimal::ZERO);
        assert_eq!(end.accumulated, value);
    }

    #[test]
    fn depreciation_before_acquisition_is_zero() {
        let dep = straight_line(d("500"), date(2024, 6, 1), 5, date(2024, 1, 1));
        assert_eq!(dep.months_elapsed, 0);
        assert_eq!(dep.net_book_value, d("500"));
    }

    #[test]
    fn numbering_scans_same_year_only() {
        let issued = ["2025/0003", "2025/0010", "2024/0099", "2025/draft"];
        assert_eq!(next_invoice_no(2025, issued.iter().copied()), "2025/0011");
        assert_eq!(next_invoice_no(2026, issued.iter().copied()), "2026/0001");

        let students = ["20250001", "20250002", "20240007"];
        assert_eq!(next_enrollment_no(2025, students.iter().copied()), "20250003");

        let receipts: [&str; 0] = [];
        assert_eq!(next_receipt_no(2025, receipts.iter().copied()), "REC/2025/0001");
    }

    #[test]
    fn balance_is_debits_minus_credits() {
        let b = running_balance([d("100"), d("50.5")], [d("30")]);
        assert_eq!(b.total_debit, d("150.50"));
        assert_eq!(b.total_credit, d("30.00"));
        assert_eq!(b.balance, d("120.50"));
    }
}
