//! 信心分組

use super::types::SearchHit;
use std::cmp::Ordering;

/// 單一服務結果的分組，每筆結果只會出現在其中一組
#[derive(Debug, Default)]
pub struct Partition {
    /// 相似度 >= 門檻，由高到低
    pub high: Vec<SearchHit>,
    /// 相似度 < 門檻，由高到低
    pub low: Vec<SearchHit>,
}

impl Partition {
    pub fn has_high(&self) -> bool {
        !self.high.is_empty()
    }
}

pub fn partition(mut hits: Vec<SearchHit>, threshold: f32) -> Partition {
    sort_by_similarity(&mut hits);
    let (high, low) = hits.into_iter().partition(|hit| hit.similarity >= threshold);
    Partition { high, low }
}

/// 相似度由高到低（穩定排序，同分保持服務原本的順序）
pub fn sort_by_similarity(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
    });
}

pub fn meets_threshold(hits: &[SearchHit], threshold: f32) -> bool {
    hits.iter().any(|hit| hit.similarity >= threshold)
}

/// 高信心時要輸出的代表結果
pub fn representatives(high: Vec<SearchHit>, max_high_results: usize) -> Vec<SearchHit> {
    high.into_iter().take(max_high_results.max(1)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(scores: &[f32]) -> Vec<SearchHit> {
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| SearchHit::new(*s, format!("https://example.com/{}", i)))
            .collect()
    }

    #[test]
    fn test_partition_is_exclusive_and_sorted() {
        let p = partition(hits(&[40.0, 91.0, 85.0, 84.9]), 85.0);

        let high: Vec<f32> = p.high.iter().map(|h| h.similarity).collect();
        let low: Vec<f32> = p.low.iter().map(|h| h.similarity).collect();
        assert_eq!(high, vec![91.0, 85.0]);
        assert_eq!(low, vec![84.9, 40.0]);
    }

    #[test]
    fn test_representatives_respects_cap() {
        let p = partition(hits(&[99.0, 95.0, 92.0]), 90.0);
        assert_eq!(representatives(p.high.clone(), 1).len(), 1);
        assert_eq!(representatives(p.high.clone(), 2).len(), 2);
        // 0 視為 1
        assert_eq!(representatives(p.high, 0)[0].similarity, 99.0);
    }

    #[test]
    fn test_meets_threshold() {
        assert!(meets_threshold(&hits(&[10.0, 70.0]), 70.0));
        assert!(!meets_threshold(&hits(&[10.0, 69.9]), 70.0));
        assert!(!meets_threshold(&[], 0.0));
    }
}
