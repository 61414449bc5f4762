//! 接收视图：把一次原生接收事件的若干非连续片段呈现为只读、有界的字节序列。
//!
//! - **意图 (Why)**：原生栈可能把一次逻辑接收分散在多个内部缓冲里，
//!   拷贝成连续缓冲会在热路径上产生额外分配；
//! - **契约 (What)**：实现 [`bytes::Buf`] 支持顺序消费，`copy_at` 支持按偏移随机拷出；
//!   视图生命周期受限于本次回调，消费者需要在回调内完成读取；
//! - **实现提示 (How)**：内部保存片段切片与游标，跳过空片段，`advance` 越界时 panic，
//!   与 `Buf` 的约定一致。

use bytes::Buf;

#[derive(Clone, Copy, Debug)]
enum Segments<'a> {
    One(&'a [u8]),
    Many(&'a [&'a [u8]]),
}

impl<'a> Segments<'a> {
    fn count(&self) -> usize {
        match self {
            Segments::One(_) => 1,
            Segments::Many(parts) => parts.len(),
        }
    }

    fn get(&self, index: usize) -> Option<&'a [u8]> {
        match self {
            Segments::One(bytes) => (index == 0).then_some(*bytes),
            Segments::Many(parts) => parts.get(index).copied(),
        }
    }
}

/// 一次接收事件交付给消费者的只读视图。
#[derive(Clone, Debug)]
pub struct ReceiveView<'a> {
    segments: Segments<'a>,
    len: usize,
    segment: usize,
    offset: usize,
    consumed: usize,
}

impl<'a> ReceiveView<'a> {
    /// 由单个连续片段构造视图。
    pub fn contiguous(bytes: &'a [u8]) -> Self {
        Self::from_segments(Segments::One(bytes))
    }

    /// 由多个非连续片段构造视图，片段按给定顺序拼接。
    pub fn fragmented(parts: &'a [&'a [u8]]) -> Self {
        Self::from_segments(Segments::Many(parts))
    }

    fn from_segments(segments: Segments<'a>) -> Self {
        let len = (0..segments.count())
            .filter_map(|index| segments.get(index))
            .map(<[u8]>::len)
            .sum();
        Self {
            segments,
            len,
            segment: 0,
            offset: 0,
            consumed: 0,
        }
    }

    /// 本次交付的总字节数，不随消费变化。
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 已通过 [`Buf::advance`] 顺序消费的字节数。
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// 从视图起点的 `offset` 处拷出至多 `dst.len()` 字节，返回实际拷贝数。
    ///
    /// 该操作与顺序游标无关，偏移越界时返回 0。
    pub fn copy_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        if offset >= self.len || dst.is_empty() {
            return 0;
        }
        let mut skip = offset;
        let mut written = 0;
        for index in 0..self.segments.count() {
            let Some(part) = self.segments.get(index) else {
                break;
            };
            if skip >= part.len() {
                skip -= part.len();
                continue;
            }
            let available = &part[skip..];
            skip = 0;
            let take = available.len().min(dst.len() - written);
            dst[written..written + take].copy_from_slice(&available[..take]);
            written += take;
            if written == dst.len() {
                break;
            }
        }
        written
    }

    /// 把剩余未消费的字节拷贝为连续 `Vec`，主要服务于测试与日志。
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; self.remaining()];
        let copied = self.copy_at(self.consumed, &mut out);
        out.truncate(copied);
        out
    }
}

impl Buf for ReceiveView<'_> {
    fn remaining(&self) -> usize {
        self.len - self.consumed
    }

    fn chunk(&self) -> &[u8] {
        let mut index = self.segment;
        let mut offset = self.offset;
        while let Some(part) = self.segments.get(index) {
            if offset < part.len() {
                return &part[offset..];
            }
            index += 1;
            offset = 0;
        }
        &[]
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(
            cnt <= self.remaining(),
            "cannot advance past end of receive view: {cnt} > {}",
            self.remaining()
        );
        self.consumed += cnt;
        while cnt > 0 {
            let Some(part) = self.segments.get(self.segment) else {
                break;
            };
            let left = part.len() - self.offset;
            if cnt < left {
                self.offset += cnt;
                return;
            }
            cnt -= left;
            self.segment += 1;
            self.offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn sequential_consumption_crosses_fragment_boundaries() {
        let parts: [&[u8]; 4] = [b"hel", b"", b"lo ", b"world"];
        let mut view = ReceiveView::fragmented(&parts);
        assert_eq!(view.len(), 11);
        assert_eq!(view.chunk(), b"hel");

        view.advance(4);
        assert_eq!(view.chunk(), b"o ");
        assert_eq!(view.consumed(), 4);

        let mut rest = String::new();
        view.reader().read_to_string(&mut rest).expect("视图读取不会失败");
        assert_eq!(rest, "o world");
    }

    #[test]
    fn copy_at_reads_random_offsets_without_moving_cursor() {
        let parts: [&[u8]; 3] = [b"ab", b"cde", b"f"];
        let view = ReceiveView::fragmented(&parts);
        let mut dst = [0u8; 3];
        assert_eq!(view.copy_at(1, &mut dst), 3);
        assert_eq!(&dst, b"bcd");
        assert_eq!(view.copy_at(5, &mut dst), 1);
        assert_eq!(dst[0], b'f');
        assert_eq!(view.copy_at(6, &mut dst), 0);
        assert_eq!(view.consumed(), 0);
    }

    #[test]
    fn to_vec_returns_unconsumed_suffix() {
        let mut view = ReceiveView::contiguous(b"payload");
        view.advance(3);
        assert_eq!(view.to_vec(), b"load");
    }

    #[test]
    #[should_panic(expected = "cannot advance past end")]
    fn advancing_past_end_panics() {
        let mut view = ReceiveView::contiguous(b"xy");
        view.advance(3);
    }
}
