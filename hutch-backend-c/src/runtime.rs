//! The embedded runtime header: object layout, refcount macros, the value
//! union and the container records the generated code leans on. Emitted at
//! the top of every program unless the driver splices a runtime file.

pub const RUNTIME_HEADER: &str = r#"#pragma once

#include <stdio.h>
#include <stdlib.h>
#include <ctype.h>
#include <limits.h>
#include <assert.h>
#include <string.h>
#include <stdbool.h>
#include <stddef.h>
#include <stdint.h>
#include <stdarg.h>

#define EXIT() {assert(0); exit(1);}
#define RAISE_TRAP() {fprintf(stderr, "raise reached generated code\n"); EXIT();}

struct thread;
struct object;

typedef void (*delete)(struct thread *thread, struct object *obj);

struct object {
    struct object *prev;
    struct object *next;
    size_t rc;
    size_t block;
    struct object *dealloc;
    delete free;
};
#define ATTACH(obj, v) {\
    (v)->prev = (obj);\
    (v)->next = (obj)->next;\
    (obj)->next = (obj)->next->prev = (v);\
}
#define DETACH(v) {\
    (v)->prev->next = (v)->next;\
    (v)->next->prev = (v)->prev;\
}

struct memblock {
    struct memblock *next;
    struct memblock *prev;
    struct object objects;
    struct object dealloc;
    size_t id;
};

struct thread {
    struct memblock memory;
    size_t block;
};

#define STACK(o)  ((o) && (o)->obj.block >= thread->block)
#define HEAP(o)   ((o) && (o)->obj.block)

#define INC(o)    (((o)->obj.rc)++)
#define DEC(o)    (--((o)->obj.rc))

#define FREE(o)   { ofree(thread, &(o)->obj); }
#define EFREE(o)  ( eofree(thread, &(o)->obj) )

#define INC_STACK(obj)      { if STACK(obj) INC(obj); }
#define INC_STACK_EXPR(obj) ( STACK(obj) && INC(obj) )

#define INC_HEAP(obj)       { if HEAP(obj) INC(obj); }
#define INC_HEAP_EXPR(obj)  ( HEAP(obj) && INC(obj) )

#define DEC_STACK(obj)      { if (STACK(obj) && !DEC(obj)) FREE(obj); }
#define DEC_STACK_KEEP(obj) { if STACK(obj) DEC(obj); }
#define DEC_STACK_EXPR(obj) ( (STACK(obj) && !DEC(obj)) ? EFREE(obj) : 0 )

#define DEC_HEAP(obj)       { if (HEAP(obj) && !DEC(obj)) FREE(obj); }

#define NEW(struct_name)  ((struct struct_name *)new(thread, sizeof(struct struct_name)))
#define NEWZ(struct_name) ((struct struct_name *)newz(thread, sizeof(struct struct_name)))

struct str {
    unsigned char *s;
    size_t n;
};

struct str_obj {
    struct object obj;
    struct str str;
    int c;
};

struct object_in_struct {
    struct object obj;
};

union u {
    struct object *obj;
    struct object_in_struct *obj_in_struct;
    struct str_obj *str;
    unsigned char ch;
    double lf;
    size_t i;
    ssize_t si;
};

enum union_type {UNION_OBJ, UNION_STR, UNION_CH, UNION_LF, UNION_I, UNION_SI};

#define UNION_IS_REF(t) (t < UNION_CH)

struct list {
    struct object obj;
    size_t n;
    size_t next_i;
    union u *v;
    enum union_type type;
};
#define MAX_LIST (SIZE_MAX / sizeof(union u))

struct dict {
    struct object obj;
    struct list keys;
    struct list values;
    size_t n;
};

struct set {
    struct object obj;
    struct list elements;
};

struct range {
    double i;
    double j;
    double k;
};

#define RT_RANGE_INIT(thread, r, i0, b1, i1, b2, i2) \
    ((r)->i = (b1) ? (double)(i0) : 0, \
     (r)->j = (b1) ? (double)(i1) : (double)(i0), \
     (r)->k = (b2) ? (double)(i2) : 1)
#define RT_RANGE_NOTDONE(thread, r) \
    (((r)->k > 0) ? ((r)->i < (r)->j) : ((r)->i > (r)->j))
#define RT_RANGE_PROMOTE(thread, r) ((r)->i += (r)->k)
#define RT_RANGE_CURRENT(thread, r) ((r)->i)

#define RT_STR_LEN(thread, s)  ((s)->str.n)
#define RT_STR_AT(thread, s, i) \
    ((s)->str.s[(ssize_t)(i) < 0 ? (size_t)((ssize_t)(s)->str.n + (ssize_t)(i)) \
                                 : (size_t)(i)])
#define RT_CHAR_LEN(thread, c) ((size_t)1)
#define RT_CHAR_ISSPACE(thread, c) (isspace(c) != 0)
#define RT_CHAR_ISDIGIT(thread, c) (isdigit(c) != 0)
#define RT_CHAR_LOWER(thread, c)   ((unsigned char)tolower(c))
#define RT_LIST_LEN(thread, l) ((l)->n)
#define RT_LIST_AT(thread, l, i) ((l)->v[(size_t)(i)])
#define RT_DICT_LEN(thread, d) ((d)->n)
#define RT_SET_LEN(thread, s)  ((s)->elements.n)

void *new(struct thread *thread, size_t size);
void *newz(struct thread *thread, size_t size);
void ofree(struct thread *thread, struct object *obj);
int eofree(struct thread *thread, struct object *obj);

void rt_thread_init(struct thread *thread);
struct str_obj *rt_chars_to_str(struct thread *thread, unsigned char *ch, size_t n);
void rt_str_free(struct thread *thread, struct str_obj *s);
struct str_obj *rt_read_input(struct thread *thread);

void rt_print_strings(struct thread *thread, size_t n, ...);
void rt_print_str(struct thread *thread, const char *fmt, struct str_obj *s, bool flush);

bool rt_str_eq(struct thread *thread, struct str_obj *a, struct str_obj *b);
bool rt_str_neq(struct thread *thread, struct str_obj *a, struct str_obj *b);
bool rt_str_isin(struct thread *thread, struct str_obj *hay, unsigned char needle);
bool rt_str_isspace(struct thread *thread, struct str_obj *s);
bool rt_str_isdigit(struct thread *thread, struct str_obj *s);
bool rt_str_startswith(struct thread *thread, struct str_obj *s, struct str_obj *prefix);
struct str_obj *rt_str_lower(struct thread *thread, struct str_obj *s);
struct str_obj *rt_str_plus(struct thread *thread, struct str_obj *a, struct str_obj *b);
struct str_obj *rt_str_plus_equals(struct thread *thread, struct str_obj *a, struct str_obj *b);
struct str_obj *rt_str_range(struct thread *thread, struct str_obj *s,
                             bool bi, ssize_t i, bool bj, ssize_t j, bool bk, ssize_t k);
struct str_obj *rt_char_str(struct thread *thread, unsigned char c);
struct str_obj *rt_char_plus(struct thread *thread, unsigned char c, struct str_obj *s);

struct str_obj *rt_float_str(struct thread *thread, double v);
struct str_obj *rt_bool_str(struct thread *thread, bool v);
struct str_obj *rt_int_str(struct thread *thread, size_t v);
double rt_ord(struct thread *thread, struct str_obj *s);
unsigned char rt_chr(struct thread *thread, double code);

struct list *new_list(struct thread *thread, union u *v, size_t n, enum union_type type);
void rt_list_push(struct thread *thread, struct list *l, union u v);
union u rt_list_pop(struct thread *thread, struct list *l);
bool rt_list_isin(struct thread *thread, struct list *l, union u v);
void rt_list_set(struct thread *thread, struct list *l, double i, union u v);

struct dict *new_dict(struct thread *thread, union u *keys, union u *values, size_t n,
                      enum union_type key_type, enum union_type value_type);
bool rt_dict_isin(struct thread *thread, struct dict *d, union u key);
union u rt_dict_at(struct thread *thread, struct dict *d, union u key);
void rt_dict_set(struct thread *thread, struct dict *d, union u key, union u value);
bool rt_dict_values_isin(struct thread *thread, struct list *values, union u v);

struct set *new_set(struct thread *thread, union u *v, size_t n, enum union_type type);
bool rt_set_isin(struct thread *thread, struct set *s, union u v);
"#;
