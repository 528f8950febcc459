//! CRON表达式解析与下次触发时间计算
//!
//! 支持5段（分 时 日 月 周）与6段（秒 分 时 日 月 周）两种格式，
//! 每段支持 `*`、`?`、逗号列表、`a-b` 范围、`a-b/step` 与 `*/step` 步长，
//! 月份与星期可使用英文缩写（`JAN`、`MON`）。星期取值 0-7，0 与 7 都表示周日。
//!
//! 日与星期同时受限时采用经典规则：满足其一即匹配。

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike,
    Utc,
};
use chrono_tz::Tz;
use jobcenter_core::{SchedulerError, SchedulerResult};

/// 向前搜索的最大年数，超过即认为表达式不会再触发
const SEARCH_YEARS: i32 = 10;

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    aliases: &'static [&'static str],
}

const SECONDS: FieldSpec = FieldSpec {
    name: "second",
    min: 0,
    max: 59,
    aliases: &[],
};
const MINUTES: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    aliases: &[],
};
const HOURS: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    aliases: &[],
};
const DAYS_OF_MONTH: FieldSpec = FieldSpec {
    name: "day",
    min: 1,
    max: 31,
    aliases: &[],
};
const MONTHS: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    aliases: &[
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ],
};
const DAYS_OF_WEEK: FieldSpec = FieldSpec {
    name: "weekday",
    min: 0,
    max: 7,
    aliases: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
};

/// 某一段允许取值的位集合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }
}

/// 解析后的CRON表达式
#[derive(Debug, Clone, PartialEq)]
pub struct CronExpression {
    source: String,
    timezone: Tz,
    /// 5段格式时为 None，只在第0秒触发
    seconds: Option<FieldSet>,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    /// 按 UTC 解析
    pub fn parse(expr: &str) -> SchedulerResult<Self> {
        Self::parse_with_timezone(expr, "UTC")
    }

    pub fn parse_with_timezone(expr: &str, timezone: &str) -> SchedulerResult<Self> {
        let timezone = parse_timezone(expr, timezone)?;
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let (seconds, rest) = match fields.len() {
            5 => (None, &fields[..]),
            6 => (Some(parse_field(expr, fields[0], &SECONDS)?.0), &fields[1..]),
            n => {
                return Err(SchedulerError::invalid_cron(
                    expr,
                    format!("需要5或6个字段，实际为{n}个"),
                ))
            }
        };

        let (minutes, _) = parse_field(expr, rest[0], &MINUTES)?;
        let (hours, _) = parse_field(expr, rest[1], &HOURS)?;
        let (days_of_month, dom_restricted) = parse_field(expr, rest[2], &DAYS_OF_MONTH)?;
        let (months, _) = parse_field(expr, rest[3], &MONTHS)?;
        let (mut days_of_week, dow_restricted) = parse_field(expr, rest[4], &DAYS_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week = FieldSet((days_of_week.0 | 1) & !(1u64 << 7));
        }

        Ok(Self {
            source: expr.to_string(),
            timezone,
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted,
            dow_restricted,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn has_seconds(&self) -> bool {
        self.seconds.is_some()
    }

    /// 严格晚于 `after` 的下一次触发时间；表达式在可搜索范围内不会再触发时返回 None
    pub fn next_execution_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit_year = after.year().saturating_add(SEARCH_YEARS);
        let mut candidate = self.step_past(after.with_timezone(&self.timezone).naive_local());

        loop {
            let naive = self.next_naive(candidate, limit_year)?;
            let resolved = match self.timezone.from_local_datetime(&naive) {
                LocalResult::Single(t) => vec![t],
                LocalResult::Ambiguous(early, late) => vec![early, late],
                // 夏令时跳过的本地时间不存在
                LocalResult::None => Vec::new(),
            };
            if let Some(hit) = resolved
                .into_iter()
                .map(|t| t.with_timezone(&Utc))
                .find(|t| *t > after)
            {
                return Some(hit);
            }
            candidate = self.step_past(naive);
        }
    }

    /// 从 `after` 开始的惰性触发时间序列
    pub fn upcoming(&self, after: DateTime<Utc>) -> CronIter {
        CronIter {
            expression: self.clone(),
            cursor: after,
        }
    }

    pub fn upcoming_times(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.upcoming(after).take(count).collect()
    }

    pub fn time_until_next_execution(&self, from: DateTime<Utc>) -> Option<Duration> {
        self.next_execution_time(from).map(|next| next - from)
    }

    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.timezone).naive_local();
        self.months.contains(local.month())
            && self.day_matches(local.date())
            && self.hours.contains(local.hour())
            && self.minutes.contains(local.minute())
            && match self.seconds {
                Some(s) => s.contains(local.second()),
                None => local.second() == 0,
            }
    }

    /// 推进到下一个最小单位的起点
    fn step_past(&self, t: NaiveDateTime) -> NaiveDateTime {
        let base = t.with_nanosecond(0).unwrap_or(t);
        if self.seconds.is_some() {
            base + Duration::seconds(1)
        } else {
            base.with_second(0).unwrap_or(base) + Duration::minutes(1)
        }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// 在本地时间上依次检查 月 -> 日 -> 时 -> 分 -> 秒，不匹配则跳到下一个单位的起点
    fn next_naive(&self, mut t: NaiveDateTime, limit_year: i32) -> Option<NaiveDateTime> {
        loop {
            if t.year() > limit_year {
                return None;
            }

            if !self.months.contains(t.month()) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.hours.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }

            if !self.minutes.contains(t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1);
                continue;
            }

            if let Some(seconds) = self.seconds {
                if !seconds.contains(t.second()) {
                    t += Duration::seconds(1);
                    continue;
                }
            }

            return Some(t);
        }
    }
}

impl FromStr for CronExpression {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.source, self.timezone)
    }
}

/// 惰性、可克隆的触发时间迭代器
#[derive(Debug, Clone)]
pub struct CronIter {
    expression: CronExpression,
    cursor: DateTime<Utc>,
}

impl Iterator for CronIter {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.expression.next_execution_time(self.cursor)?;
        self.cursor = next;
        Some(next)
    }
}

/// 验证CRON表达式是否有效
pub fn validate_cron_expression(expr: &str) -> bool {
    CronExpression::parse(expr).is_ok()
}

fn parse_timezone(expr: &str, timezone: &str) -> SchedulerResult<Tz> {
    let name = timezone.trim();
    if name.is_empty() || name.eq_ignore_ascii_case("utc") {
        return Ok(Tz::UTC);
    }
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::invalid_cron(expr, format!("未知的时区: {name}")))
}

fn parse_value(expr: &str, raw: &str, spec: &FieldSpec) -> SchedulerResult<u32> {
    if let Ok(v) = raw.parse::<u32>() {
        if v < spec.min || v > spec.max {
            return Err(SchedulerError::invalid_cron(
                expr,
                format!("{} 取值 {v} 超出范围 {}-{}", spec.name, spec.min, spec.max),
            ));
        }
        return Ok(v);
    }

    let upper = raw.to_ascii_uppercase();
    spec.aliases
        .iter()
        .position(|a| *a == upper)
        .map(|i| i as u32 + if spec.min == 1 { 1 } else { 0 })
        .ok_or_else(|| {
            SchedulerError::invalid_cron(expr, format!("{} 字段无法解析: {raw}", spec.name))
        })
}

/// 解析单个字段，返回取值集合以及该字段是否受限（不以 `*`/`?` 开头）
fn parse_field(expr: &str, field: &str, spec: &FieldSpec) -> SchedulerResult<(FieldSet, bool)> {
    let unrestricted = field.starts_with('*') || field.starts_with('?');
    let mut bits = 0u64;

    for part in field.split(',') {
        if part.is_empty() {
            return Err(SchedulerError::invalid_cron(
                expr,
                format!("{} 字段存在空列表项", spec.name),
            ));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    SchedulerError::invalid_cron(expr, format!("{} 步长无效: {step}", spec.name))
                })?;
                if step == 0 {
                    return Err(SchedulerError::invalid_cron(
                        expr,
                        format!("{} 步长不能为0", spec.name),
                    ));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" || range == "?" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(expr, a, spec)?, parse_value(expr, b, spec)?)
        } else {
            let v = parse_value(expr, range, spec)?;
            if step.is_some() {
                (v, spec.max)
            } else {
                (v, v)
            }
        };

        if lo > hi {
            return Err(SchedulerError::invalid_cron(
                expr,
                format!("{} 范围起点大于终点: {lo}-{hi}", spec.name),
            ));
        }

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            bits |= 1u64 << v;
        }
    }

    Ok((FieldSet(bits), !unrestricted))
}
