/// Tabla única estado -> gesto. El índice es la posición en la salida del
/// clasificador y en el vector de creencia.
pub const GESTURES: [(usize, &str); NUM_GESTURES] = [
    (0, "Swipe Forward"),
    (1, "Swipe Backward"),
    (2, "Swipe Left"),
    (3, "Swipe Right"),
    (4, "Fast Pinch"),
    (5, "Pinch Open"),
    (6, "Side Tap"),
    (7, "Nothing"),
    (8, "Pinch Hold"),
];

pub const NUM_GESTURES: usize = 9;

/// Estado de reposo
pub const REST: usize = 7;
/// Clase que abre una sesión de rotación
pub const ROTATION_START: usize = 5;
/// Clase que cierra una sesión de rotación
pub const ROTATION_END: usize = 6;
/// Estado "rotando": nunca lo emite el clasificador
pub const ROTATING: usize = 8;

/// Comprueba en compilación que cada índice aparece una sola vez y
/// coincide con su posición en la tabla
const fn table_is_one_to_one(table: &[(usize, &str)]) -> bool {
    let mut i = 0;
    while i < table.len() {
        if table[i].0 != i {
            return false;
        }
        let mut j = i + 1;
        while j < table.len() {
            if table[i].0 == table[j].0 {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const _: () = assert!(
    table_is_one_to_one(&GESTURES),
    "gesture table has a duplicate or misplaced index"
);
const _: () = assert!(REST < NUM_GESTURES && ROTATING < NUM_GESTURES);
const _: () = assert!(ROTATION_START < NUM_GESTURES && ROTATION_END < NUM_GESTURES);

/// Nombre legible de un estado
pub fn label(index: usize) -> Option<&'static str> {
    GESTURES.get(index).map(|(_, name)| *name)
}

/// Índice a partir del nombre (sin distinguir mayúsculas)
pub fn index_of(name: &str) -> Option<usize> {
    GESTURES
        .iter()
        .find(|(_, n)| n.eq_ignore_ascii_case(name))
        .map(|(idx, _)| *idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_both_ways() {
        for (idx, name) in GESTURES {
            assert_eq!(label(idx), Some(name));
            assert_eq!(index_of(name), Some(idx));
        }
        assert_eq!(label(NUM_GESTURES), None);
        assert_eq!(index_of("pinch hold"), Some(ROTATING));
    }

    #[test]
    fn test_duplicate_key_detected() {
        let broken = [(0, "a"), (1, "b"), (1, "c")];
        assert!(!table_is_one_to_one(&broken));
        let shuffled = [(1, "a"), (0, "b")];
        assert!(!table_is_one_to_one(&shuffled));
    }
}
