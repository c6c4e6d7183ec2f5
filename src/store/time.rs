use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};

use crate::error::GatewayError;

// 北京时间时区 (UTC+8)；统计周期以此为准
pub const BEIJING_OFFSET: FixedOffset = FixedOffset::east_opt(8 * 3600).unwrap();
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 每日统计周期在北京时间 15:00 滚动
pub const RESET_HOUR: u32 = 15;

pub fn beijing_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&BEIJING_OFFSET)
}

/// UTC 时间序列化为数据库存储格式（与 CURRENT_TIMESTAMP 一致）
pub fn to_utc_string(dt: &DateTime<Utc>) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

pub fn parse_utc_string(s: &str) -> crate::error::Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .map_err(|e| GatewayError::Config(format!("time parse error: {}", e)))?;
    Ok(naive.and_utc())
}

/// 当前统计周期的起点：最近一次过去的北京时间 15:00
pub fn current_period_start() -> DateTime<FixedOffset> {
    period_start_for(beijing_now())
}

pub fn period_start_for(now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    // 固定时差时区不存在本地时间空洞，single() 恒有值
    let today_reset = now
        .date_naive()
        .and_hms_opt(RESET_HOUR, 0, 0)
        .and_then(|naive| BEIJING_OFFSET.from_local_datetime(&naive).single())
        .unwrap_or(now);
    if now < today_reset {
        today_reset - Duration::days(1)
    } else {
        today_reset
    }
}

/// 下一次清理时刻：未来最近的北京时间 15:00
pub fn next_reset_after(now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let start = period_start_for(now);
    start + Duration::days(1)
}

/// 日志时间戳用北京时间输出
pub struct BeijingTimer;

impl tracing_subscriber::fmt::time::FormatTime for BeijingTimer {
    fn format_time(
        &self,
        w: &mut tracing_subscriber::fmt::format::Writer<'_>,
    ) -> std::fmt::Result {
        write!(w, "{}", beijing_now().format(DATETIME_FORMAT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bj(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<FixedOffset> {
        BEIJING_OFFSET.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn period_starts_yesterday_before_reset_hour() {
        let now = bj(2025, 3, 10, 9, 30);
        assert_eq!(period_start_for(now), bj(2025, 3, 9, 15, 0));
    }

    #[test]
    fn period_starts_today_after_reset_hour() {
        let now = bj(2025, 3, 10, 15, 0);
        assert_eq!(period_start_for(now), bj(2025, 3, 10, 15, 0));
        let now = bj(2025, 3, 10, 23, 59);
        assert_eq!(period_start_for(now), bj(2025, 3, 10, 15, 0));
    }

    #[test]
    fn next_reset_is_strictly_in_the_future() {
        for now in [bj(2025, 3, 10, 9, 30), bj(2025, 3, 10, 15, 0), bj(2025, 3, 10, 20, 0)] {
            assert!(next_reset_after(now) > now);
        }
    }

    #[test]
    fn utc_string_roundtrip() {
        let dt = Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap();
        let s = to_utc_string(&dt);
        assert_eq!(s, "2025-06-01 07:00:00");
        assert_eq!(parse_utc_string(&s).unwrap(), dt);
    }
}
