use chrono::NaiveDate;
use regex::Regex;
use std::fmt::Write as _;
use std::sync::OnceLock;

use crate::indicators::{summarize_intraday, summarize_kline, IntradayIndicators, KlineIndicators};
use crate::models::{
    Bar, DailyView, ForecastSummary, StepKind, StepRecord, Symbol, TradingDaySegment,
};

pub const SYSTEM_PROMPT: &str = "你是一位专业的A股量化交易分析师，擅长技术分析和短线交易策略。";

/// The model is asked to open its forecast with this marker.
pub const PREDICTION_MARKER: &str = "【次日预测】";
pub const RECONCILIATION_HEADER: &str = "【上一交易日预测复盘】";
pub const FINAL_FORECAST_HEADER: &str = "【最终预测任务】";
pub const REFERENCE_PREDICTION_HEADER: &str = "【最近一次预测（仅供参考）】";

const KLINE_ROWS: usize = 10;
const HISTORY_EXCERPT_CHARS: usize = 160;

/// Renders step prompts for one stock. Holds no per-run state.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    symbol: Symbol,
    name: String,
}

impl PromptBuilder {
    pub fn new(symbol: Symbol, name: impl Into<String>) -> Self {
        Self {
            symbol,
            name: name.into(),
        }
    }

    /// Prompt for one observed trading day. `prior` is the previous step's
    /// prediction, quoted verbatim; step 1 passes `None`.
    pub fn reflective_step(
        &self,
        step: usize,
        total_segments: usize,
        segment: &TradingDaySegment,
        daily: DailyView<'_>,
        prior: Option<&str>,
        history: &[StepRecord],
    ) -> String {
        let mut prompt = String::new();
        self.write_header(&mut prompt);
        let _ = writeln!(
            prompt,
            "当前为第{}/{}个交易日的逐日复盘分析，分析日期：{}\n",
            step, total_segments, segment.date
        );

        if let Some(prior) = prior {
            let _ = writeln!(prompt, "{}", RECONCILIATION_HEADER);
            let _ = writeln!(prompt, "以下是你在上一步给出的预测原文：");
            let _ = writeln!(prompt, "<<<\n{}\n>>>", prior);
            let _ = writeln!(
                prompt,
                "请对照{}的实际分时走势，逐条核对上述预测：哪些判断得到验证，哪些出现偏差，偏差的原因是什么，需要如何修正分析框架。\n",
                segment.date
            );
        }

        write_history(&mut prompt, history);
        self.write_daily_context(&mut prompt, daily, Some(segment.date));

        let _ = writeln!(prompt, "【{} 分时成交数据】", segment.date);
        match summarize_intraday(&segment.ticks) {
            Some(intraday) => write_intraday(&mut prompt, &intraday),
            None => {
                let _ = writeln!(prompt, "当日无分时成交记录。");
            }
        }

        let _ = writeln!(prompt, "\n【分析任务】");
        let _ = writeln!(
            prompt,
            "1. 结合日K线背景、大盘指数与当日分时数据，分析主力资金动向、量价关系及关键支撑/压力位。"
        );
        let _ = writeln!(prompt, "2. 判断当日走势所处阶段及短线情绪变化。");
        let _ = writeln!(
            prompt,
            "3. 在回答末尾以“{}”开头，给出对下一个交易日的走势预测、关键价位、操作方向与投资评级。",
            PREDICTION_MARKER
        );
        prompt
    }

    /// Prompt for the next unobserved trading day. Contains no reconciliation
    /// section; the last prediction is quoted for reference only.
    pub fn final_forecast(
        &self,
        daily: DailyView<'_>,
        last_date: Option<NaiveDate>,
        last_prediction: Option<&str>,
        history: &[StepRecord],
    ) -> String {
        let mut prompt = String::new();
        self.write_header(&mut prompt);
        let _ = writeln!(prompt, "{}", FINAL_FORECAST_HEADER);
        match last_date {
            Some(date) => {
                let _ = writeln!(
                    prompt,
                    "逐日分析已完成，最后一个已观察交易日为{}。请预测下一个交易日的走势。\n",
                    date
                );
            }
            None => {
                let _ = writeln!(
                    prompt,
                    "分析区间内没有可用的分时成交数据，请仅依据日K线与大盘指数预测下一个交易日的走势。\n"
                );
            }
        }

        if let Some(prediction) = last_prediction {
            let _ = writeln!(prompt, "{}", REFERENCE_PREDICTION_HEADER);
            let _ = writeln!(prompt, "<<<\n{}\n>>>\n", prediction);
        }

        write_history(&mut prompt, history);
        self.write_daily_context(&mut prompt, daily, last_date);

        let _ = writeln!(prompt, "\n【输出要求】");
        let _ = writeln!(
            prompt,
            "1. 以“{}”开头给出下一个交易日的走势预测，包括开盘预期、日内关键价位（支撑/压力）与量能预期。",
            PREDICTION_MARKER
        );
        let _ = writeln!(prompt, "2. 单独一行写明“操作方向：买入/持有/卖出/观望”。");
        let _ = writeln!(
            prompt,
            "3. 单独一行写明“投资评级：强烈推荐/推荐/中性/谨慎/回避”。"
        );
        let _ = writeln!(prompt, "4. 列出主要风险提示。");
        prompt
    }

    fn write_header(&self, prompt: &mut String) {
        let board = self.symbol.board();
        let _ = writeln!(
            prompt,
            "股票：{}（{}），所属板块：{}，涨跌停幅度：±{:.0}%\n",
            self.name,
            self.symbol,
            board,
            board.limit_ratio() * 100.0
        );
    }

    fn write_daily_context(&self, prompt: &mut String, daily: DailyView<'_>, date: Option<NaiveDate>) {
        let _ = writeln!(prompt, "【日K线背景】");
        if daily.bars.is_empty() {
            let _ = writeln!(prompt, "暂无日K线数据。\n");
        } else {
            let _ = writeln!(prompt, "日期 | 开盘 | 最高 | 最低 | 收盘 | 成交量 | 涨跌幅");
            let from = daily.bars.len().saturating_sub(KLINE_ROWS);
            for bar in &daily.bars[from..] {
                let _ = writeln!(
                    prompt,
                    "{} | {:.2} | {:.2} | {:.2} | {:.2} | {:.0} | {:+.2}%",
                    bar.date, bar.open, bar.high, bar.low, bar.close, bar.volume, bar.change_pct
                );
            }
            write_kline_indicators(prompt, &summarize_kline(daily.bars));

            if let Some(prev_close) = date.and_then(|d| daily.previous_close(d)) {
                let ratio = self.symbol.board().limit_ratio();
                let _ = writeln!(
                    prompt,
                    "前收盘价：{:.2}，涨停价：{:.2}，跌停价：{:.2}",
                    prev_close,
                    prev_close * (1.0 + ratio),
                    prev_close * (1.0 - ratio)
                );
            }
            let _ = writeln!(prompt);
        }

        let _ = writeln!(prompt, "【大盘指数】");
        if daily.indices.is_empty() {
            let _ = writeln!(prompt, "暂无大盘指数数据。");
        }
        for series in daily.indices {
            let _ = write!(prompt, "{}（{}）：", series.name, series.code);
            write_series_close(prompt, daily.index_bars(series));
        }
        let _ = writeln!(prompt);

        if let Some(sector) = daily.sector {
            let bars = daily.index_bars(sector);
            let _ = writeln!(prompt, "【行业板块】{}", sector.name);
            write_series_close(prompt, bars);
            if let (Some(board), Some(stock)) = (window_change(bars), window_change(daily.bars)) {
                let _ = writeln!(
                    prompt,
                    "近{}日累计涨跌：板块 {:+.2}%，个股 {:+.2}%",
                    RELATIVE_WINDOW, board, stock
                );
            }
            let _ = writeln!(prompt);
        }
    }
}

/// Days compared in the stock-versus-industry line.
const RELATIVE_WINDOW: usize = 5;

fn write_series_close(prompt: &mut String, bars: &[Bar]) {
    let Some(bar) = bars.last() else {
        let _ = writeln!(prompt, "暂无数据");
        return;
    };
    let _ = writeln!(
        prompt,
        "{} 收盘 {:.2}，涨跌幅 {:+.2}%，近{}日走势：{}",
        bar.date,
        bar.close,
        bar.change_pct,
        bars.len().min(5),
        bars[bars.len().saturating_sub(5)..]
            .iter()
            .map(|b| format!("{:.2}", b.close))
            .collect::<Vec<_>>()
            .join(" → ")
    );
}

/// Percent change from the close `RELATIVE_WINDOW` bars back to the last close.
fn window_change(bars: &[Bar]) -> Option<f64> {
    let last = bars.last()?;
    let base = bars.get(bars.len().checked_sub(RELATIVE_WINDOW + 1)?)?;
    (base.close > 0.0).then(|| (last.close - base.close) / base.close * 100.0)
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v))
}

fn write_kline_indicators(prompt: &mut String, k: &KlineIndicators) {
    let _ = writeln!(
        prompt,
        "均线：MA5 {} / MA10 {} / MA20 {} / MA60 {}",
        fmt_opt(k.ma5),
        fmt_opt(k.ma10),
        fmt_opt(k.ma20),
        fmt_opt(k.ma60)
    );
    let _ = writeln!(
        prompt,
        "指数均线：EMA5 {} / EMA10 {} / EMA20 {} / EMA60 {}",
        fmt_opt(k.ema5),
        fmt_opt(k.ema10),
        fmt_opt(k.ema20),
        fmt_opt(k.ema60)
    );
    if !k.macd_bar_recent.is_empty() {
        let _ = writeln!(
            prompt,
            "近{}日MACD柱：{}",
            k.macd_bar_recent.len(),
            k.macd_bar_recent
                .iter()
                .map(|v| format!("{:.3}", v))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    let _ = writeln!(
        prompt,
        "MACD：DIF {} / DEA {} / 柱 {}；RSI：6日 {} / 12日 {} / 14日 {}",
        fmt_opt(k.macd_dif),
        fmt_opt(k.macd_dea),
        fmt_opt(k.macd_bar),
        fmt_opt(k.rsi6),
        fmt_opt(k.rsi12),
        fmt_opt(k.rsi14)
    );
    let _ = writeln!(
        prompt,
        "KDJ：K {} / D {} / J {}；布林带：上轨 {} / 中轨 {} / 下轨 {}",
        fmt_opt(k.kdj_k),
        fmt_opt(k.kdj_d),
        fmt_opt(k.kdj_j),
        fmt_opt(k.boll_upper),
        fmt_opt(k.boll_middle),
        fmt_opt(k.boll_lower)
    );
    let _ = writeln!(
        prompt,
        "成交量均线：VOL5 {} / VOL10 {}",
        fmt_opt(k.volume_ma5),
        fmt_opt(k.volume_ma10)
    );
}

fn write_intraday(prompt: &mut String, d: &IntradayIndicators) {
    let _ = writeln!(
        prompt,
        "开盘 {:.2}，最高 {:.2}，最低 {:.2}，收盘 {:.2}，均价 {:.2}，成交笔数 {}，总成交量 {:.0}，笔均量 {:.0}",
        d.open, d.high, d.low, d.close, d.vwap, d.tick_count, d.total_volume, d.avg_volume
    );
    let ratio = if d.sell_volume > 0.0 {
        format!("{:.2}", d.buy_volume / d.sell_volume)
    } else {
        "-".to_string()
    };
    let _ = writeln!(
        prompt,
        "主动买入(U) {:.0}，主动卖出(D) {:.0}，中性(E) {:.0}，U/D {}",
        d.buy_volume, d.sell_volume, d.neutral_volume, ratio
    );
    let _ = writeln!(prompt, "分时量能分布：");
    for s in &d.sessions {
        let _ = writeln!(
            prompt,
            "  {}：{:.0}（{:.1}%），U {:.0} / D {:.0} / E {:.0}",
            s.label, s.volume, s.share_pct, s.buy_volume, s.sell_volume, s.neutral_volume
        );
    }
    let _ = writeln!(
        prompt,
        "分时EMA：5笔 {} / 10笔 {} / 20笔 {}；分时MACD：DIF {} / DEA {} / 柱 {}",
        fmt_opt(d.ema5),
        fmt_opt(d.ema10),
        fmt_opt(d.ema20),
        fmt_opt(d.macd_dif),
        fmt_opt(d.macd_dea),
        fmt_opt(d.macd_bar)
    );
    let _ = writeln!(
        prompt,
        "最近成交价：{}",
        d.recent_prices
            .iter()
            .map(|p| format!("{:.2}", p))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = writeln!(
        prompt,
        "最近成交量：{}",
        d.recent_volumes
            .iter()
            .map(|v| format!("{:.0}", v))
            .collect::<Vec<_>>()
            .join(", ")
    );
}

// Older steps only; the immediate prior prediction is quoted in full elsewhere
fn write_history(prompt: &mut String, history: &[StepRecord]) {
    let older = &history[..history.len().saturating_sub(1)];
    if older.is_empty() {
        return;
    }
    let _ = writeln!(prompt, "【历史分析摘要】");
    for record in older {
        let label = match &record.kind {
            StepKind::Reflective { date } => date.to_string(),
            StepKind::FinalForecast { .. } => "最终预测".to_string(),
        };
        let excerpt: String = record.prediction.chars().take(HISTORY_EXCERPT_CHARS).collect();
        let ellipsis = if record.prediction.chars().count() > HISTORY_EXCERPT_CHARS {
            "…"
        } else {
            ""
        };
        let _ = writeln!(
            prompt,
            "第{}步（{}）预测：{}{}",
            record.step,
            label,
            excerpt.replace('\n', " "),
            ellipsis
        );
    }
    let _ = writeln!(prompt);
}

/// Text following the last prediction marker, or the whole trimmed response
/// when the marker is absent or followed by nothing.
pub fn extract_prediction(response: &str) -> String {
    if let Some(pos) = response.rfind(PREDICTION_MARKER) {
        let after = response[pos + PREDICTION_MARKER.len()..].trim();
        if !after.is_empty() {
            return after.to_string();
        }
    }
    response.trim().to_string()
}

fn action_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\*\*[^*\n]*?操作方向\*\*\s*[：:]\s*\*\*(.+?)\*\*",
            r"\*\*操作方向[：:](.+?)\*\*",
            r"\*\*操作方向\*\*\s*\|\s*(.+?)\s*\|",
            r"操作方向[：:]\s*([^\n\r]+)",
            r"\*\*交易建议\*\*[：:]\s*([^\n\r]+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn rating_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\*\*投资评级\*\*\s*\|\s*(.+?)\s*\|",
            r"\*\*[^*\n]*?投资评级\*\*\s*[：:]\s*\*\*(.+?)\*\*",
            r"\*\*投资评级[：:](.+?)\*\*",
            r"投资评级[：:]\s*([^\n\r]+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn first_match(patterns: &[Regex], text: &str) -> Option<String> {
    patterns.iter().find_map(|re| {
        let raw = re.captures(text)?.get(1)?.as_str();
        let cleaned: String = raw
            .replace("**", "")
            .chars()
            .filter(|c| !matches!(c, '✅' | '❌' | '🟢' | '🟡' | '🔴' | '📊'))
            .collect();
        let cleaned = cleaned.trim().to_string();
        (!cleaned.is_empty()).then_some(cleaned)
    })
}

/// Trading action (操作方向) and rating (投资评级) stated in a forecast.
pub fn extract_summary(text: &str) -> ForecastSummary {
    ForecastSummary {
        action: first_match(action_patterns(), text),
        rating: first_match(rating_patterns(), text),
    }
}
