//! Parsers for the eastmoney fund data script and the holdings archive page.

use std::{collections::HashMap, sync::LazyLock};

use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

static JS_ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"var\s+([A-Za-z_$][\w$]*)\s*=\s*").unwrap());
static BOX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<div class=['\x22]box['\x22]>").unwrap());
static QUARTER_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})年(\d)季度股票投资明细").unwrap());
static ROW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<tr[^>]*>(.*?)</tr>").unwrap());
static CELL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<td[^>]*>(.*?)</td>").unwrap());
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

#[derive(Debug, Clone, Deserialize)]
pub struct NetWorthPoint {
    /// Milliseconds since the epoch, midnight of the trading day
    pub x: i64,
    #[serde(rename = "equityReturn", default)]
    pub equity_return: f64,
}

#[derive(Debug, Clone, Default)]
pub struct FundInfo {
    pub name: Option<String>,
    pub code: Option<String>,
    pub syl_1y: Option<String>,
    pub syl_3y: Option<String>,
    pub syl_6y: Option<String>,
    pub syl_1n: Option<String>,
    pub net_worth_trend: Vec<NetWorthPoint>,
}

impl FundInfo {
    /// Fund data scripts for unknown codes are empty shells.
    pub fn is_known(&self) -> bool {
        self.name.is_some() && !self.net_worth_trend.is_empty()
    }

    /// `(label, percent)` for the periods the script carries.
    pub fn stage_returns(&self) -> Vec<(&'static str, f64)> {
        [
            ("近1月", &self.syl_1y),
            ("近3月", &self.syl_3y),
            ("近6月", &self.syl_6y),
            ("近1年", &self.syl_1n),
        ]
        .into_iter()
        .filter_map(|(label, value)| Some((label, value.as_deref()?.trim().parse().ok()?)))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyReturn {
    pub date: NaiveDate,
    pub equity_return: f64,
}

/// Top-ten holdings for one quarter.
#[derive(Debug, Clone, PartialEq)]
pub struct Holdings {
    pub year: i32,
    pub quarter: u32,
    pub stocks: Vec<Holding>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Holding {
    pub code: String,
    pub name: String,
    pub ratio: f64,
}

/// Collects every `var name = <json>;` assignment in the script. Values that
/// are not JSON are skipped.
pub fn js_assignments(script: &str) -> HashMap<String, Value> {
    JS_ASSIGNMENT
        .captures_iter(script)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str();
            let rest = &script[caps.get(0)?.end()..];
            // Scalars followed by `;` trip the stream parser
            let value = serde_json::Deserializer::from_str(rest)
                .into_iter::<Value>()
                .next()
                .and_then(Result::ok)
                .or_else(|| serde_json::from_str(rest.split(';').next()?.trim()).ok())?;
            Some((name.to_owned(), value))
        })
        .collect()
}

fn string_var(vars: &HashMap<String, Value>, name: &str) -> Option<String> {
    match vars.get(name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_fund_js(script: &str) -> FundInfo {
    let vars = js_assignments(script);

    // A malformed point drops only itself
    let net_worth_trend = vars
        .get("Data_netWorthTrend")
        .and_then(Value::as_array)
        .map(|points| {
            points
                .iter()
                .filter_map(|point| NetWorthPoint::deserialize(point).ok())
                .collect()
        })
        .unwrap_or_default();

    FundInfo {
        name: string_var(&vars, "fS_name"),
        code: string_var(&vars, "fS_code"),
        syl_1y: string_var(&vars, "syl_1y"),
        syl_3y: string_var(&vars, "syl_3y"),
        syl_6y: string_var(&vars, "syl_6y"),
        syl_1n: string_var(&vars, "syl_1n"),
        net_worth_trend,
    }
}

/// The last `days` points, newest first, dated in `timezone`.
pub fn recent_daily_returns(trend: &[NetWorthPoint], days: usize, timezone: Tz) -> Vec<DailyReturn> {
    trend
        .iter()
        .rev()
        .take(days)
        .filter_map(|point| {
            let date = DateTime::from_timestamp_millis(point.x)?
                .with_timezone(&timezone)
                .date_naive();
            Some(DailyReturn {
                date,
                equity_return: point.equity_return,
            })
        })
        .collect()
}

fn cell_text(html: &str) -> String {
    TAG.replace_all(html, "")
        .replace("&nbsp;", " ")
        .trim()
        .to_owned()
}

/// Parses the `FundArchivesDatas.aspx?type=jjcc` response and keeps the
/// latest quarter. `None` when the page lists no quarters.
pub fn parse_holdings(page: &str) -> Option<Holdings> {
    BOX.split(page)
        .skip(1)
        .filter_map(|block| {
            let title = QUARTER_TITLE.captures(block)?;
            let year = title[1].parse().ok()?;
            let quarter = title[2].parse().ok()?;

            let stocks = ROW
                .captures_iter(block)
                .filter_map(|row| {
                    let cells: Vec<String> = CELL
                        .captures_iter(&row[1])
                        .map(|cell| cell_text(&cell[1]))
                        .collect();
                    if cells.len() < 3 {
                        return None;
                    }
                    let ratio = cells
                        .iter()
                        .skip(3)
                        .find_map(|cell| cell.strip_suffix('%'))?
                        .trim()
                        .parse()
                        .ok()?;
                    Some(Holding {
                        code: cells[1].clone(),
                        name: cells[2].clone(),
                        ratio,
                    })
                })
                .take(10)
                .collect();

            Some(Holdings {
                year,
                quarter,
                stocks,
            })
        })
        .max_by_key(|holdings| (holdings.year, holdings.quarter))
}

#[cfg(test)]
mod tests {
    use chrono_tz::Asia::Shanghai;

    use super::*;

    const SCRIPT: &str = r#"/*fund*/var ishb=false;/*基金名称*/var fS_name = "易方达蓝筹精选混合";var fS_code = "005827";
        var fund_sourceRate="1.50";var fund_Rate="0.15";var fund_minsg="10";
        var stockCodes=["6005191","0008582"];
        var syl_1n="12.34";var syl_6y="-3.2";var syl_3y="";var syl_1y="0.51";
        var Data_netWorthTrend = [{"x":1754841600000,"y":1.8,"equityReturn":0.5,"unitMoney":""},{"x":1754928000000,"y":1.79,"equityReturn":-0.56,"unitMoney":""}];
        var Data_fluctuationScale = {"categories":["2024-06-30"],"series":[{"y":1.2,"mom":"-5%"}]};
        var pageCallback = function(){ return 1; };"#;

    #[test]
    fn parses_fund_script() {
        let info = parse_fund_js(SCRIPT);
        assert!(info.is_known());
        assert_eq!(info.name.as_deref(), Some("易方达蓝筹精选混合"));
        assert_eq!(info.code.as_deref(), Some("005827"));
        assert_eq!(info.net_worth_trend.len(), 2);
        assert_eq!(info.stage_returns(), vec![("近1月", 0.51), ("近6月", -3.2), ("近1年", 12.34)]);
    }

    #[test]
    fn unknown_fund_script_is_not_known() {
        assert!(!parse_fund_js("var fS_name = \"\";").is_known());
        assert!(!parse_fund_js("").is_known());
    }

    #[test]
    fn malformed_trend_points_are_skipped() {
        let info = parse_fund_js(
            r#"var fS_name = "测试基金";
            var Data_netWorthTrend = [{"x":1754841600000,"y":1.8,"equityReturn":0.5},{"x":null,"y":null,"equityReturn":null},"oops",{"x":1754928000000,"y":1.79,"equityReturn":-0.56}];"#,
        );
        assert!(info.is_known());
        let days: Vec<i64> = info.net_worth_trend.iter().map(|point| point.x).collect();
        assert_eq!(days, vec![1754841600000, 1754928000000]);
    }

    #[test]
    fn recent_returns_are_newest_first_in_local_dates() {
        let info = parse_fund_js(SCRIPT);
        let recent = recent_daily_returns(&info.net_worth_trend, 7, Shanghai);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].date, NaiveDate::from_ymd_opt(2025, 8, 12).unwrap());
        assert_eq!(recent[0].equity_return, -0.56);
        assert_eq!(recent[1].date, NaiveDate::from_ymd_opt(2025, 8, 11).unwrap());

        assert_eq!(recent_daily_returns(&info.net_worth_trend, 1, Shanghai).len(), 1);
    }

    #[test]
    fn picks_latest_quarter_of_holdings() {
        let page = r#"var apidata={ content:"<div class='box'><div class='boxitem w790'><h4 class='t'><label class='left'><a href='#'>易方达蓝筹精选混合</a>&nbsp;&nbsp;2025年1季度股票投资明细</label></h4><table><thead><tr><th>序号</th><th>股票代码</th><th>股票名称</th><th>相关资讯</th><th>占净值<br />比例</th></tr></thead><tbody><tr><td>1</td><td><a href='//quote'>00700</a></td><td class='tol'><a href='#'>腾讯控股</a></td><td class='tor'><a href='#'>股吧</a></td><td class='tor'>9.50%</td><td class='tor'>100.00</td></tr></tbody></table></div></div><div class='box'><div class='boxitem w790'><h4 class='t'><label class='left'>易方达蓝筹精选混合&nbsp;&nbsp;2025年2季度股票投资明细</label></h4><table><tbody><tr><td>1</td><td><a>600519</a></td><td class='tol'><a>贵州茅台</a></td><td class='tor'><a>变动详情</a></td><td class='tor'>9.87%</td></tr><tr><td>2</td><td>00700</td><td class='tol'>腾讯控股</td><td></td><td class='tor'>9.12%</td></tr></tbody></table></div></div>",arryear:[2025,2024],curyear:2025};"#;

        let holdings = parse_holdings(page).unwrap();
        assert_eq!((holdings.year, holdings.quarter), (2025, 2));
        assert_eq!(
            holdings.stocks,
            vec![
                Holding {
                    code: "600519".to_owned(),
                    name: "贵州茅台".to_owned(),
                    ratio: 9.87,
                },
                Holding {
                    code: "00700".to_owned(),
                    name: "腾讯控股".to_owned(),
                    ratio: 9.12,
                },
            ]
        );
    }

    #[test]
    fn empty_archive_has_no_holdings() {
        assert_eq!(parse_holdings(r#"var apidata={ content:"",arryear:[],curyear:2025};"#), None);
    }
}
