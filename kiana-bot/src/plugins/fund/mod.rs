//! Six-digit fund codes: recent daily returns, stage returns and the
//! latest top-ten holdings, sent as a merged forward message.

mod parser;

use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use chrono_tz::Tz;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, warn};

pub use parser::{
    DailyReturn, FundInfo, Holding, Holdings, parse_fund_js, parse_holdings, recent_daily_returns,
};

use super::PluginContext;
use crate::{
    dispatch::Matcher,
    onebot::{Bot, MessageEvent},
    settings::FundSettings,
};

const PLUGIN: &str = "fund";

static FUND_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{6}$").unwrap());

#[derive(Clone)]
pub struct FundClient {
    http: Client,
    settings: FundSettings,
}

impl FundClient {
    pub fn new(http: Client, settings: FundSettings) -> Self {
        Self { http, settings }
    }

    pub async fn fetch_info(&self, code: &str) -> Result<FundInfo> {
        let url = format!(
            "{}/pingzhongdata/{code}.js",
            self.settings.data_base_url.trim_end_matches('/')
        );
        let script = self
            .http
            .get(&url)
            .send()
            .await
            .context("Fund data request failed")?
            .error_for_status()
            .context("Fund data error response")?
            .text()
            .await
            .context("Failed to read fund data")?;
        Ok(parse_fund_js(&script))
    }

    pub async fn fetch_holdings(&self, code: &str, year: i32) -> Result<Option<Holdings>> {
        let url = format!(
            "{}/FundArchivesDatas.aspx",
            self.settings.archive_base_url.trim_end_matches('/')
        );
        let year = year.to_string();
        let page = self
            .http
            .get(&url)
            .query(&[
                ("type", "jjcc"),
                ("code", code),
                ("topline", "10"),
                ("year", year.as_str()),
            ])
            .send()
            .await
            .context("Holdings request failed")?
            .error_for_status()
            .context("Holdings error response")?
            .text()
            .await
            .context("Failed to read holdings")?;
        Ok(parse_holdings(&page))
    }
}

fn format_return(value: f64) -> String {
    if value > 0.0 {
        format!("+{value:.2}%")
    } else {
        format!("{value:.2}%")
    }
}

pub fn format_summary(code: &str, info: &FundInfo, recent: &[DailyReturn]) -> String {
    let mut lines = vec![
        info.name.clone().unwrap_or_else(|| format!("基金 {code}")),
        format!("代码: {code}"),
        String::new(),
        "最近交易日收益:".to_owned(),
    ];
    lines.extend(
        recent
            .iter()
            .map(|day| format!("{}: {}", day.date.format("%Y-%m-%d"), format_return(day.equity_return))),
    );
    lines.push(String::new());
    lines.push("阶段收益:".to_owned());
    lines.extend(
        info.stage_returns()
            .into_iter()
            .map(|(label, value)| format!("{label}: {value:.2}%")),
    );
    lines.join("\n")
}

pub fn format_holdings(code: &str, holdings: Option<&Holdings>) -> String {
    let Some(holdings) = holdings.filter(|holdings| !holdings.stocks.is_empty()) else {
        return format!("基金 {code}\n暂无持仓数据");
    };

    let mut lines = vec![
        format!(
            "十大重仓股 ({}年{}季度股票投资明细)",
            holdings.year, holdings.quarter
        ),
        String::new(),
    ];
    lines.extend(
        holdings
            .stocks
            .iter()
            .enumerate()
            .map(|(i, stock)| format!("{}. {}({}) {:.2}%", i + 1, stock.name, stock.code, stock.ratio)),
    );
    lines.join("\n")
}

pub struct FundQuery {
    client: FundClient,
    recent_days: usize,
    timezone: Tz,
}

impl FundQuery {
    pub fn new(client: FundClient, recent_days: usize, timezone: Tz) -> Self {
        Self {
            client,
            recent_days,
            timezone,
        }
    }

    /// Forward node texts for `code`; empty when the fund is unknown.
    pub async fn build_texts(&self, code: &str) -> Vec<String> {
        let info = match self.client.fetch_info(code).await {
            Ok(info) if info.is_known() => info,
            Ok(_) => {
                debug!("No fund with code {code}");
                return Vec::new();
            }
            Err(e) => {
                warn!("Failed to fetch fund {code}: {e:#}");
                return Vec::new();
            }
        };

        let recent = recent_daily_returns(&info.net_worth_trend, self.recent_days, self.timezone);
        let mut texts = vec![format_summary(code, &info, &recent)];

        let year = Utc::now().with_timezone(&self.timezone).year();
        match self.client.fetch_holdings(code, year).await {
            Ok(holdings) => texts.push(format_holdings(code, holdings.as_ref())),
            Err(e) => warn!("Failed to fetch holdings of {code}: {e:#}"),
        }

        texts
    }
}

#[async_trait]
impl Matcher for FundQuery {
    fn plugin(&self) -> &'static str {
        PLUGIN
    }

    fn block(&self) -> bool {
        true
    }

    fn matches(&self, event: &MessageEvent) -> bool {
        FUND_CODE.is_match(event.plain_text().trim())
    }

    async fn handle(&self, bot: &Bot, event: &MessageEvent) -> Result<()> {
        let code = event.plain_text().trim().to_owned();
        let texts = self.build_texts(&code).await;
        if texts.is_empty() {
            return Ok(());
        }

        let nodes: Vec<_> = texts.into_iter().map(|text| bot.forward_node(text)).collect();
        bot.send_forward(event, &nodes).await?;
        Ok(())
    }
}

pub fn matcher(ctx: &PluginContext) -> Arc<FundQuery> {
    let settings = ctx.settings.fund.clone();
    let recent_days = settings.recent_days;
    Arc::new(FundQuery::new(
        FundClient::new(ctx.http.clone(), settings),
        recent_days,
        ctx.config.timezone,
    ))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn summary_lists_returns_with_signs() {
        let info = FundInfo {
            name: Some("测试基金".to_owned()),
            syl_1y: Some("1.234".to_owned()),
            syl_1n: Some("-5".to_owned()),
            ..FundInfo::default()
        };
        let recent = vec![
            DailyReturn {
                date: NaiveDate::from_ymd_opt(2025, 8, 12).unwrap(),
                equity_return: 0.5,
            },
            DailyReturn {
                date: NaiveDate::from_ymd_opt(2025, 8, 11).unwrap(),
                equity_return: -0.25,
            },
            DailyReturn {
                date: NaiveDate::from_ymd_opt(2025, 8, 8).unwrap(),
                equity_return: 0.0,
            },
        ];

        assert_eq!(
            format_summary("000001", &info, &recent),
            "测试基金\n代码: 000001\n\n最近交易日收益:\n2025-08-12: +0.50%\n2025-08-11: -0.25%\n2025-08-08: 0.00%\n\n阶段收益:\n近1月: 1.23%\n近1年: -5.00%"
        );
    }

    #[test]
    fn holdings_are_numbered() {
        let holdings = Holdings {
            year: 2025,
            quarter: 2,
            stocks: vec![Holding {
                code: "600519".to_owned(),
                name: "贵州茅台".to_owned(),
                ratio: 9.8,
            }],
        };
        assert_eq!(
            format_holdings("000001", Some(&holdings)),
            "十大重仓股 (2025年2季度股票投资明细)\n\n1. 贵州茅台(600519) 9.80%"
        );
        assert_eq!(format_holdings("000001", None), "基金 000001\n暂无持仓数据");
    }

    #[test]
    fn only_bare_six_digit_codes_match() {
        assert!(FUND_CODE.is_match("005827"));
        assert!(!FUND_CODE.is_match("0058271"));
        assert!(!FUND_CODE.is_match("基金005827"));
    }
}
