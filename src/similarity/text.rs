use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// 两段文字前统一加上的公共词，保证词表非空
pub const SHARED_PREFIX_TOKEN: &str = "af";

/// 至少两个字符的单词
static TOKEN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w\w+\b").expect("static token pattern"));

fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    TOKEN_PATTERN
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn term_counts(text: &str) -> BTreeMap<String, f64> {
    let mut counts = BTreeMap::new();
    let prefixed = format!("{} {}", SHARED_PREFIX_TOKEN, text);
    for token in tokenize(&prefixed) {
        *counts.entry(token).or_insert(0.0) += 1.0;
    }
    counts
}

/// 在二文档语料 {a, b} 上构建 TF-IDF 向量后计算余弦相似度
///
/// - 词频为原始计数，idf 使用平滑公式 `ln((1 + n) / (1 + df)) + 1`
/// - 每个向量做 L2 归一化
/// - 对称：`score_text(a, b) == score_text(b, a)`
/// - 完全相同的两段文字（包括两个空串）得分为 1.0
pub fn score_text(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }

    let counts_a = term_counts(a);
    let counts_b = term_counts(b);

    // 词表按字典序排列，保证两种参数顺序下求和顺序一致
    let mut vocabulary: Vec<&String> = counts_a.keys().chain(counts_b.keys()).collect();
    vocabulary.sort();
    vocabulary.dedup();

    let n_docs = 2.0;
    let mut vec_a = Vec::with_capacity(vocabulary.len());
    let mut vec_b = Vec::with_capacity(vocabulary.len());
    for term in &vocabulary {
        let tf_a = counts_a.get(*term).copied().unwrap_or(0.0);
        let tf_b = counts_b.get(*term).copied().unwrap_or(0.0);
        let df = (tf_a > 0.0) as u8 as f64 + (tf_b > 0.0) as u8 as f64;
        let idf = ((1.0 + n_docs) / (1.0 + df)).ln() + 1.0;
        vec_a.push(tf_a * idf);
        vec_b.push(tf_b * idf);
    }

    normalize(&mut vec_a);
    normalize(&mut vec_b);

    let dot: f64 = vec_a.iter().zip(&vec_b).map(|(x, y)| x * y).sum();
    dot.clamp(0.0, 1.0)
}

fn normalize(vector: &mut [f64]) {
    let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
